//! Artifact backends for Shipyard.
//!
//! Provides the concrete build/push backends:
//! - apko (OS images)
//! - melange (APK packages)
//! - Docker (Dockerfile images, via the Engine API)
//! - Helm (charts)
//!
//! Backends form a closed set; [`AnyBackend`] dispatches to the one matching
//! a configuration's kind.

pub mod apko;
pub mod archive;
pub mod crane;
pub mod docker;
pub mod helm;
pub mod melange;
pub mod process;

use async_trait::async_trait;
use shipyard_core::{
    ArtifactHandle, Backend, BackendConfig, BackendKind, BuildId, CredentialEntry,
    ImageReference, Platform, PublishedRef, RawArtifact, Result,
};
use std::path::PathBuf;

pub use apko::ApkoBackend;
pub use crane::Crane;
pub use docker::DockerBackend;
pub use helm::HelmBackend;
pub use melange::MelangeBackend;

/// Tool locations and scratch directory shared by all backends.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Directory tool outputs are written to.
    pub work_dir: PathBuf,
    pub apko: String,
    pub melange: String,
    pub helm: String,
    pub crane: String,
}

impl BackendSettings {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            apko: "apko".to_string(),
            melange: "melange".to_string(),
            helm: "helm".to_string(),
            crane: "crane".to_string(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("shipyard"))
    }
}

/// One of the supported backends.
pub enum AnyBackend {
    Apko(ApkoBackend),
    Melange(MelangeBackend),
    Docker(DockerBackend),
    Helm(HelmBackend),
}

impl AnyBackend {
    /// Backend for `kind`. Only Docker needs a live connection.
    pub fn for_kind(kind: BackendKind, settings: &BackendSettings) -> Result<Self> {
        Ok(match kind {
            BackendKind::Apko => AnyBackend::Apko(ApkoBackend::new(settings)),
            BackendKind::Melange => AnyBackend::Melange(MelangeBackend::new(settings)),
            BackendKind::Docker => AnyBackend::Docker(DockerBackend::new(settings)?),
            BackendKind::Helm => AnyBackend::Helm(HelmBackend::new(settings)),
        })
    }

    /// Backend able to build `config`.
    pub fn for_config(config: &BackendConfig, settings: &BackendSettings) -> Result<Self> {
        Self::for_kind(config.kind(), settings)
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            AnyBackend::Apko(b) => b,
            AnyBackend::Melange(b) => b,
            AnyBackend::Docker(b) => b,
            AnyBackend::Helm(b) => b,
        }
    }
}

#[async_trait]
impl Backend for AnyBackend {
    fn kind(&self) -> BackendKind {
        match self {
            AnyBackend::Apko(_) => BackendKind::Apko,
            AnyBackend::Melange(_) => BackendKind::Melange,
            AnyBackend::Docker(_) => BackendKind::Docker,
            AnyBackend::Helm(_) => BackendKind::Helm,
        }
    }

    fn platform_independent(&self) -> bool {
        self.inner().platform_independent()
    }

    async fn prepare(&self, id: BuildId, config: &BackendConfig) -> Result<BackendConfig> {
        if config.kind() != self.kind() {
            return Err(config.mismatch(self.kind()));
        }
        self.inner().prepare(id, config).await
    }

    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact> {
        if config.kind() != self.kind() {
            return Err(config.mismatch(self.kind()));
        }
        self.inner().build(id, config, platform).await
    }

    async fn login(&self, credentials: &CredentialEntry) -> Result<()> {
        self.inner().login(credentials).await
    }

    async fn push(
        &self,
        artifact: &ArtifactHandle,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<PublishedRef> {
        self.inner().push(artifact, target, credentials).await
    }

    async fn alias(
        &self,
        published: &PublishedRef,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<()> {
        self.inner().alias(published, target, credentials).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::Error;
    use shipyard_core::backend::{ApkoConfig, HelmConfig};

    #[test]
    fn test_for_kind_selects_variant() {
        let settings = BackendSettings::new("/work");
        let apko = AnyBackend::for_kind(BackendKind::Apko, &settings).unwrap();
        assert_eq!(apko.kind(), BackendKind::Apko);
        assert!(!apko.platform_independent());

        let helm = AnyBackend::for_config(
            &BackendConfig::Helm(HelmConfig::new("charts/web")),
            &settings,
        )
        .unwrap();
        assert_eq!(helm.kind(), BackendKind::Helm);
        assert!(helm.platform_independent());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_mismatched_config() {
        let settings = BackendSettings::new("/work");
        let melange = AnyBackend::for_kind(BackendKind::Melange, &settings).unwrap();
        let err = melange
            .build(
                BuildId::new(),
                &BackendConfig::Apko(ApkoConfig::new("apko.yaml")),
                &Platform::new("linux", "amd64"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
