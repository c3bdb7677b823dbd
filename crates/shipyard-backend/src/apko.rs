//! apko OS image backend.

use async_trait::async_trait;
use shipyard_core::backend::ApkoConfig;
use shipyard_core::{
    ArtifactContent, ArtifactHandle, Backend, BackendConfig, BackendKind, BuildId,
    CredentialEntry, Digest, Error, ImageReference, Platform, PublishedRef, RawArtifact, Result,
};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::crane::{Crane, child_target, platform_suffix};
use crate::process::ToolCommand;
use crate::archive::file_artifact;
use crate::BackendSettings;

/// Builds OCI image tarballs with `apko` and pushes them with `crane`.
#[derive(Debug, Clone)]
pub struct ApkoBackend {
    binary: String,
    work_dir: PathBuf,
    crane: Crane,
}

impl ApkoBackend {
    pub fn new(settings: &BackendSettings) -> Self {
        Self {
            binary: settings.apko.clone(),
            work_dir: settings.work_dir.join("apko"),
            crane: Crane::new(&settings.crane),
        }
    }

    /// apko spells architectures like the OCI platform, minus the OS.
    fn arch(platform: &Platform) -> String {
        match platform.variant() {
            Some(variant) => format!("{}/{}", platform.arch(), variant),
            None => platform.arch().to_string(),
        }
    }

    pub fn build_command(
        &self,
        config: &ApkoConfig,
        tag: &str,
        platform: &Platform,
        output: &Path,
    ) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .arg("build")
            .arg(&config.config)
            .arg(tag)
            .arg(output)
            .arg("--arch")
            .arg(Self::arch(platform))
            .repeated("--keyring-append", &config.keyring_append)
            .repeated("--repository-append", &config.repository_append)
            .repeated("--package-append", &config.package_append)
            .optional("--cache-dir", config.cache_dir.as_ref())
    }

    fn output_path(&self, id: BuildId, platform: &Platform) -> PathBuf {
        self.work_dir
            .join(id.short())
            .join(platform_suffix(platform))
            .join("image.tar")
    }

    async fn push_one(crane: &Crane, raw: &RawArtifact, target: &ImageReference) -> Result<Digest> {
        let ArtifactContent::OciArchive { path } = &raw.content else {
            return Err(Error::Internal(format!(
                "apko cannot push {:?} content",
                raw.content
            )));
        };
        crane.push(path, target).await
    }
}

#[async_trait]
impl Backend for ApkoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Apko
    }

    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact> {
        let BackendConfig::Apko(apko) = config else {
            return Err(config.mismatch(BackendKind::Apko));
        };

        let output = self.output_path(id, platform);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        let tag = config.local_reference(id);
        info!(config = %apko.config.display(), platform = %platform, "apko build");
        self.build_command(apko, &tag, platform, &output)
            .run()
            .await?;

        file_artifact(
            BackendKind::Apko,
            platform,
            ArtifactContent::OciArchive { path: output },
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
            let raw = &artifact.manifests()[0];
            let digest = Self::push_one(&crane, raw, target).await?;
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
