//! melange package backend.
//!
//! Packages are built into a per-platform repository directory. Publishing
//! wraps that directory as the single layer of an OCI artifact.

use async_trait::async_trait;
use shipyard_core::backend::MelangeConfig;
use shipyard_core::{
    ArtifactContent, ArtifactHandle, Backend, BackendConfig, BackendKind, BuildId,
    CredentialEntry, Digest, Error, ImageReference, Platform, PublishedRef, RawArtifact, Result,
};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::archive::{file_artifact, tar_directory};
use crate::crane::{Crane, child_target, platform_suffix};
use crate::process::ToolCommand;
use crate::BackendSettings;

#[derive(Debug, Clone)]
pub struct MelangeBackend {
    binary: String,
    work_dir: PathBuf,
    crane: Crane,
}

impl MelangeBackend {
    pub fn new(settings: &BackendSettings) -> Self {
        Self {
            binary: settings.melange.clone(),
            work_dir: settings.work_dir.join("melange"),
            crane: Crane::new(&settings.crane),
        }
    }

    /// melange names architectures the apk way.
    fn arch(platform: &Platform) -> &'static str {
        match (platform.arch(), platform.variant()) {
            ("amd64", _) => "x86_64",
            ("arm64", _) => "aarch64",
            ("arm", Some("v6")) => "armhf",
            ("arm", _) => "armv7",
            ("386", _) => "x86",
            ("ppc64le", _) => "ppc64le",
            ("s390x", _) => "s390x",
            ("riscv64", _) => "riscv64",
            _ => "unknown",
        }
    }

    pub fn bump_command(&self, config: &Path, version: &str) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .arg("bump")
            .arg(config)
            .arg(version)
    }

    /// Private copy of the configuration for one build.
    fn staged_config(&self, id: BuildId, config: &MelangeConfig) -> PathBuf {
        let file_name = config
            .config
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "melange.yaml".into());
        self.work_dir.join(id.short()).join(file_name)
    }

    pub fn build_command(&self, config: &MelangeConfig, platform: &Platform, out_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .arg("build")
            .arg(&config.config)
            .arg("--arch")
            .arg(Self::arch(platform))
            .arg("--out-dir")
            .arg(out_dir)
            .optional("--signing-key", config.signing_key.as_ref())
            .optional("--source-dir", config.source_dir.as_ref())
            .repeated("--keyring-append", &config.keyring_append)
            .repeated("--repository-append", &config.repository_append)
    }

    fn out_dir(&self, id: BuildId, platform: &Platform) -> PathBuf {
        self.work_dir
            .join(id.short())
            .join(platform_suffix(platform))
    }

    async fn push_one(crane: &Crane, raw: &RawArtifact, target: &ImageReference) -> Result<Digest> {
        let ArtifactContent::Directory { path } = &raw.content else {
            return Err(Error::Internal(format!(
                "melange cannot push {:?} content",
                raw.content
            )));
        };

        let layer = path.with_extension("layer.tar");
        tar_directory(path.clone(), layer.clone()).await?;
        crane.append(&layer, target).await
    }
}

#[async_trait]
impl Backend for MelangeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Melange
    }

    /// Bump the version on a private copy of the configuration, once for
    /// all platforms. The caller's file is never modified.
    async fn prepare(&self, id: BuildId, config: &BackendConfig) -> Result<BackendConfig> {
        let BackendConfig::Melange(melange) = config else {
            return Err(config.mismatch(BackendKind::Melange));
        };
        let Some(version) = &melange.version else {
            return Ok(config.clone());
        };

        let staged = self.staged_config(id, melange);
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("failed to create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::copy(&melange.config, &staged).await.map_err(|e| {
            Error::Config(format!("cannot read {}: {}", melange.config.display(), e))
        })?;

        info!(config = %melange.config.display(), version = %version, "melange bump");
        self.bump_command(&staged, version).run().await?;

        let mut prepared = melange.clone();
        prepared.config = staged;
        prepared.version = None;
        // Sources stay relative to the original configuration.
        if prepared.source_dir.is_none() {
            prepared.source_dir = melange
                .config
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .or_else(|| Some(PathBuf::from(".")));
        }
        Ok(BackendConfig::Melange(prepared))
    }

    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact> {
        let BackendConfig::Melange(melange) = config else {
            return Err(config.mismatch(BackendKind::Melange));
        };
        if Self::arch(platform) == "unknown" {
            return Err(Error::Config(format!("melange cannot build for {}", platform)));
        }

        if melange.version.is_some() {
            return Err(Error::Internal(
                "melange version bump must be applied by prepare".to_string(),
            ));
        }

        let out_dir = self.out_dir(id, platform);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| Error::Internal(format!("failed to create {}: {}", out_dir.display(), e)))?;

        info!(config = %melange.config.display(), platform = %platform, "melange build");
        self.build_command(melange, platform, &out_dir).run().await?;

        file_artifact(
            BackendKind::Melange,
            platform,
            ArtifactContent::Directory { path: out_dir },
        )
        .await
    }

    async fn login(&self, credentials: &CredentialEntry) -> Result<()> {
        self.crane.session(&self.work_dir, Some(credentials)).await?;
        Ok(())
    }

    async fn push(
        &self,
        artifact: &ArtifactHandle,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<PublishedRef> {
        let (_auth, crane) = self.crane.session(&self.work_dir, credentials).await?;

        if !artifact.is_multi_platform() {
            let digest = Self::push_one(&crane, &artifact.manifests()[0], target).await?;
            return Ok(PublishedRef::new(target, digest));
        }

        let mut children = Vec::with_capacity(artifact.manifests().len());
        for raw in artifact.manifests() {
            let child = child_target(target, &raw.platform)?;
            let digest = Self::push_one(&crane, raw, &child).await?;
            children.push(format!("{}@{}", child.name(), digest));
        }
        let digest = crane.index_append(&children, target).await?;
        Ok(PublishedRef::new(target, digest))
    }

    async fn alias(
        &self,
        published: &PublishedRef,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<()> {
        let (_auth, crane) = self.crane.session(&self.work_dir, credentials).await?;
        crane.copy(&published.reference, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MelangeBackend {
        MelangeBackend::new(&BackendSettings::new("/work"))
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(MelangeBackend::arch(&Platform::new("linux", "amd64")), "x86_64");
        assert_eq!(MelangeBackend::arch(&Platform::new("linux", "arm64")), "aarch64");
        assert_eq!(
            MelangeBackend::arch(&Platform::new("linux", "arm").with_variant("v7")),
            "armv7"
        );
        assert_eq!(MelangeBackend::arch(&Platform::new("linux", "mips")), "unknown");
    }

    #[test]
    fn test_build_command() {
        let mut config = MelangeConfig::new("hello.yaml");
        config.signing_key = Some(PathBuf::from("melange.rsa"));
        config.source_dir = Some(PathBuf::from("src"));
        config.repository_append = vec!["https://packages.wolfi.dev/os".to_string()];

        let cmd = backend().build_command(&config, &Platform::new("linux", "arm64"), Path::new("/out"));
        assert_eq!(
            cmd.arg_strings(),
            vec![
                "build",
                "hello.yaml",
                "--arch",
                "aarch64",
                "--out-dir",
                "/out",
                "--signing-key",
                "melange.rsa",
                "--source-dir",
                "src",
                "--repository-append",
                "https://packages.wolfi.dev/os",
            ]
        );
    }

    #[test]
    fn test_bump_command() {
        let cmd = backend().bump_command(Path::new("hello.yaml"), "1.2.3");
        assert_eq!(cmd.arg_strings(), vec!["bump", "hello.yaml", "1.2.3"]);
    }

    /// A stand-in `melange` that logs each invocation and edits the file it
    /// is asked to bump.
    #[cfg(unix)]
    fn fake_melange(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("melange");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1 $2\" >> {log}\nif [ \"$1\" = bump ]; then echo \"version: $3\" >> \"$2\"; fi\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_bump_runs_once_on_private_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (script, log) = fake_melange(dir.path());
        let source = dir.path().join("hello.yaml");
        std::fs::write(&source, "package:\n  name: hello\n").unwrap();

        let mut settings = BackendSettings::new(dir.path().join("work"));
        settings.melange = script.to_string_lossy().into_owned();
        let backend = MelangeBackend::new(&settings);

        let mut melange = MelangeConfig::new(&source);
        melange.version = Some("1.2.3".to_string());
        let id = BuildId::new();

        let prepared = backend.prepare(id, &BackendConfig::Melange(melange)).await.unwrap();
        let amd = Platform::new("linux", "amd64");
        let arm = Platform::new("linux", "arm64");
        let (a, b) = tokio::join!(
            backend.build(id, &prepared, &amd),
            backend.build(id, &prepared, &arm)
        );
        a.unwrap();
        b.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let bumps: Vec<&str> = calls.lines().filter(|l| l.starts_with("bump")).collect();
        assert_eq!(bumps.len(), 1, "calls: {}", calls);
        assert_eq!(calls.lines().filter(|l| l.starts_with("build")).count(), 2);

        assert_eq!(
            std::fs::read_to_string(&source).unwrap(),
            "package:\n  name: hello\n"
        );

        let BackendConfig::Melange(prepared) = prepared else {
            panic!("expected a melange configuration");
        };
        assert_ne!(prepared.config, source);
        assert!(prepared.config.starts_with(dir.path().join("work")));
        assert!(prepared.version.is_none());
        assert_eq!(prepared.source_dir.as_deref(), Some(dir.path()));
        assert!(
            std::fs::read_to_string(&prepared.config)
                .unwrap()
                .ends_with("version: 1.2.3\n")
        );
    }

    #[tokio::test]
    async fn test_prepare_without_version_is_passthrough() {
        let config = BackendConfig::Melange(MelangeConfig::new("hello.yaml"));
        let prepared = backend().prepare(BuildId::new(), &config).await.unwrap();
        assert_eq!(prepared, config);
    }

    #[tokio::test]
    async fn test_unsupported_platform_is_config_error() {
        let config = BackendConfig::Melange(MelangeConfig::new("hello.yaml"));
        let err = backend()
            .build(BuildId::new(), &config, &Platform::new("linux", "mips"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
