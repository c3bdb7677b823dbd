//! Backend trait and per-backend build configuration.
//!
//! Backends build one artifact kind for one platform and know how to push it.
//! The pipeline only ever talks to them through [`Backend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::{ArtifactHandle, BackendKind, PublishedRef, RawArtifact};
use crate::credential::CredentialEntry;
use crate::id::BuildId;
use crate::platform::Platform;
use crate::reference::ImageReference;
use crate::{Error, Result};

/// apko image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApkoConfig {
    pub name: String,
    /// Path to the apko YAML configuration.
    pub config: PathBuf,
    #[serde(default)]
    pub keyring_append: Vec<String>,
    #[serde(default)]
    pub repository_append: Vec<String>,
    #[serde(default)]
    pub package_append: Vec<String>,
    pub cache_dir: Option<PathBuf>,
}

impl ApkoConfig {
    pub fn new(config: impl Into<PathBuf>) -> Self {
        let config = config.into();
        Self {
            name: name_from_path(&config),
            config,
            keyring_append: Vec::new(),
            repository_append: Vec::new(),
            package_append: Vec::new(),
            cache_dir: None,
        }
    }
}

/// melange package build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MelangeConfig {
    pub name: String,
    /// Path to the melange YAML configuration.
    pub config: PathBuf,
    pub source_dir: Option<PathBuf>,
    pub signing_key: Option<PathBuf>,
    #[serde(default)]
    pub keyring_append: Vec<String>,
    #[serde(default)]
    pub repository_append: Vec<String>,
    /// Run `melange bump` to this version before building.
    pub version: Option<String>,
}

impl MelangeConfig {
    pub fn new(config: impl Into<PathBuf>) -> Self {
        let config = config.into();
        Self {
            name: name_from_path(&config),
            config,
            source_dir: None,
            signing_key: None,
            keyring_append: Vec::new(),
            repository_append: Vec::new(),
            version: None,
        }
    }
}

/// Dockerfile build through the Docker Engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub name: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Dockerfile path relative to the context. Defaults to `Dockerfile`.
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Multi-stage target.
    pub target: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
}

impl DockerConfig {
    pub fn new(context: impl Into<PathBuf>) -> Self {
        let context = context.into();
        Self {
            name: name_from_path(&context),
            context,
            dockerfile: None,
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            target: None,
            no_cache: false,
        }
    }

    pub fn dockerfile(&self) -> &str {
        self.dockerfile.as_deref().unwrap_or("Dockerfile")
    }
}

/// Helm chart package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmConfig {
    pub name: String,
    /// Chart directory.
    pub chart: PathBuf,
    pub version: Option<String>,
    pub app_version: Option<String>,
    #[serde(default)]
    pub dependency_update: bool,
}

impl HelmConfig {
    pub fn new(chart: impl Into<PathBuf>) -> Self {
        let chart = chart.into();
        Self {
            name: name_from_path(&chart),
            chart,
            version: None,
            app_version: None,
            dependency_update: false,
        }
    }
}

fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != ".")
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "artifact".to_string())
}

/// Build configuration for one of the supported backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Apko(ApkoConfig),
    Melange(MelangeConfig),
    Docker(DockerConfig),
    Helm(HelmConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Apko(_) => BackendKind::Apko,
            BackendConfig::Melange(_) => BackendKind::Melange,
            BackendConfig::Docker(_) => BackendKind::Docker,
            BackendConfig::Helm(_) => BackendKind::Helm,
        }
    }

    /// Artifact name, used for local references.
    pub fn name(&self) -> &str {
        match self {
            BackendConfig::Apko(c) => &c.name,
            BackendConfig::Melange(c) => &c.name,
            BackendConfig::Docker(c) => &c.name,
            BackendConfig::Helm(c) => &c.name,
        }
    }

    /// Local, platform-independent reference for a build.
    pub fn local_reference(&self, id: BuildId) -> String {
        format!("{}:{}", self.name(), id.short())
    }

    /// Error for a backend handed a configuration of another kind.
    pub fn mismatch(&self, expected: BackendKind) -> Error {
        Error::Config(format!(
            "{} backend cannot build a {} configuration",
            expected,
            self.kind()
        ))
    }
}

/// What a backend must provide to take part in a pipeline.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// True when the artifact does not depend on the target platform
    /// (charts). The pipeline then builds once, for the primary platform.
    fn platform_independent(&self) -> bool {
        false
    }

    /// Called once per build, before any platform is built. The returned
    /// configuration is what every platform build receives, so a backend can
    /// stage private inputs here instead of touching shared ones.
    async fn prepare(&self, _id: BuildId, config: &BackendConfig) -> Result<BackendConfig> {
        Ok(config.clone())
    }

    /// Build `config` for `platform`.
    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact>;

    /// Authenticate against a registry before pushing to it.
    async fn login(&self, credentials: &CredentialEntry) -> Result<()>;

    /// Push every platform of `artifact` under `target`.
    async fn push(
        &self,
        artifact: &ArtifactHandle,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<PublishedRef>;

    /// Point `target` at the already-published digest.
    async fn alias(
        &self,
        published: &PublishedRef,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_from_paths() {
        assert_eq!(ApkoConfig::new("images/base.yaml").name, "base");
        assert_eq!(MelangeConfig::new("pkgs/Hello.yaml").name, "hello");
        assert_eq!(HelmConfig::new("charts/web").name, "web");
        assert_eq!(DockerConfig::new(".").name, "artifact");
    }

    #[test]
    fn test_kind_and_local_reference() {
        let config = BackendConfig::Docker(DockerConfig::new("app"));
        assert_eq!(config.kind(), BackendKind::Docker);
        assert_eq!(config.name(), "app");

        let id = BuildId::new();
        assert_eq!(config.local_reference(id), format!("app:{}", id.short()));
    }

    #[test]
    fn test_mismatch_is_config_error() {
        let config = BackendConfig::Helm(HelmConfig::new("charts/web"));
        let err = config.mismatch(BackendKind::Apko);
        assert!(matches!(err, Error::Config(ref m) if m.contains("apko backend cannot build a helm")));
    }

    #[test]
    fn test_config_serde_tagged_by_kind() {
        let config = BackendConfig::Apko(ApkoConfig::new("apko.yaml"));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "apko");
        assert_eq!(json["config"], "apko.yaml");

        let docker: DockerConfig = DockerConfig::new("ctx");
        assert_eq!(docker.dockerfile(), "Dockerfile");
    }
}
