//! Helm chart backend.
//!
//! Charts do not depend on the target platform, so a chart is packaged once
//! and pushed as an OCI artifact.

use async_trait::async_trait;
use shipyard_core::backend::HelmConfig;
use shipyard_core::{
    ArtifactContent, ArtifactHandle, Backend, BackendConfig, BackendKind, BuildId,
    CredentialEntry, Error, ImageReference, Platform, PublishedRef, RawArtifact, Result,
};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::BackendSettings;
use crate::archive::file_artifact;
use crate::crane::{AuthScope, Crane, parse_digest, push_error};
use crate::process::ToolCommand;

#[derive(Debug, Clone)]
pub struct HelmBackend {
    binary: String,
    work_dir: PathBuf,
    crane: Crane,
}

/// Path of the packaged chart, from `helm package` output.
pub fn parse_package_path(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find_map(|line| line.split_once("saved it to:"))
        .map(|(_, path)| PathBuf::from(path.trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

/// Reference reported on the `Pushed:` line of `helm push` output.
pub fn parse_pushed_reference(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Pushed:"))
        .map(|r| r.trim().to_string())
}

impl HelmBackend {
    pub fn new(settings: &BackendSettings) -> Self {
        Self {
            binary: settings.helm.clone(),
            work_dir: settings.work_dir.join("helm"),
            crane: Crane::new(&settings.crane),
        }
    }

    pub fn package_command(&self, config: &HelmConfig, destination: &Path) -> ToolCommand {
        let cmd = ToolCommand::new(&self.binary)
            .arg("package")
            .arg(&config.chart)
            .arg("--destination")
            .arg(destination)
            .optional("--version", config.version.as_deref())
            .optional("--app-version", config.app_version.as_deref());
        if config.dependency_update {
            cmd.arg("--dependency-update")
        } else {
            cmd
        }
    }

    pub fn login_command(&self, credentials: &CredentialEntry, scope: &AuthScope) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .args(["registry", "login", credentials.address.as_str(), "--username"])
            .arg(&credentials.principal)
            .arg("--password-stdin")
            .arg("--registry-config")
            .arg(scope.helm_registry_config())
            .stdin_secret(credentials.secret.clone())
    }

    pub fn push_command(&self, chart: &Path, target: &ImageReference, scope: &AuthScope) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .arg("push")
            .arg(chart)
            .arg(format!("oci://{}", target.namespace()))
            .arg("--registry-config")
            .arg(scope.helm_registry_config())
    }

    /// Scope logged in for both helm and crane.
    async fn session(&self, credentials: Option<&CredentialEntry>) -> Result<(AuthScope, Crane)> {
        let (scope, crane) = self.crane.session(&self.work_dir, credentials).await?;
        if let Some(credentials) = credentials {
            info!(registry = %credentials.address, "helm registry login");
            self.login_command(credentials, &scope)
                .run()
                .await
                .map_err(|e| Error::Auth {
                    registry: credentials.address.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok((scope, crane))
    }
}

#[async_trait]
impl Backend for HelmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Helm
    }

    fn platform_independent(&self) -> bool {
        true
    }

    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact> {
        let BackendConfig::Helm(helm) = config else {
            return Err(config.mismatch(BackendKind::Helm));
        };

        let destination = self.work_dir.join(id.short());
        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| Error::Internal(format!("failed to create {}: {}", destination.display(), e)))?;

        info!(chart = %helm.chart.display(), "helm package");
        let output = self.package_command(helm, &destination).run().await?;
        let chart = parse_package_path(&output.stdout).ok_or_else(|| {
            Error::Internal(format!("could not find packaged chart in: {}", output.stdout.trim()))
        })?;

        file_artifact(
            BackendKind::Helm,
            platform,
            ArtifactContent::ChartArchive { path: chart },
        )
        .await
    }

    async fn login(&self, credentials: &CredentialEntry) -> Result<()> {
        self.session(Some(credentials)).await?;
        Ok(())
    }

    async fn push(
        &self,
        artifact: &ArtifactHandle,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<PublishedRef> {
        let Some(ArtifactContent::ChartArchive { path }) = artifact.contents(None) else {
            return Err(Error::Internal("helm can only push chart archives".to_string()));
        };

        let (scope, crane) = self.session(credentials).await?;
        let output = self
            .push_command(path, target, &scope)
            .run()
            .await
            .map_err(|e| push_error(e, target))?;
        let combined = output.combined();
        let digest = parse_digest(&combined).ok_or_else(|| Error::Push {
            target: target.to_string(),
            message: "helm push did not report a digest".to_string(),
        })?;

        // helm tags with the chart version; retag when the target differs.
        let pushed = parse_pushed_reference(&combined).unwrap_or_else(|| target.to_string());
        if pushed != target.to_string() {
            let source = ImageReference::parse(&pushed)?.with_digest(digest.as_str());
            crane.copy(&source.to_string(), target).await?;
        }

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
