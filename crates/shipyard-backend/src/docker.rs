//! Docker Engine backend.
//!
//! Images are built through the Engine API, one build per platform, and kept
//! in the local daemon under a per-platform tag. Single-platform images are
//! pushed through the daemon; multi-platform builds push each child and then
//! assemble the manifest list with `crane`.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions, TagImageOptions};
use bytes::Bytes;
use futures::StreamExt;
use shipyard_core::backend::DockerConfig;
use shipyard_core::{
    ArtifactContent, ArtifactHandle, Backend, BackendConfig, BackendKind, BuildId,
    CredentialEntry, Digest, Error, ImageReference, Platform, PublishedRef, RawArtifact, Result,
};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::BackendSettings;
use crate::archive::context_tarball;
use crate::crane::{Crane, child_target, parse_digest, platform_suffix};

/// Builds images with the local Docker daemon.
pub struct DockerBackend {
    docker: Docker,
    work_dir: PathBuf,
    crane: Crane,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    pub fn new(settings: &BackendSettings) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker, settings))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, settings: &BackendSettings) -> Self {
        Self {
            docker,
            work_dir: settings.work_dir.join("docker"),
            crane: Crane::new(&settings.crane),
        }
    }

    /// Local tag of one platform's image.
    fn local_tag(config: &BackendConfig, id: BuildId, platform: &Platform) -> String {
        format!("{}-{}", config.local_reference(id), platform_suffix(platform))
    }

    fn build_options(config: &DockerConfig, tag: &str, platform: &Platform) -> BuildImageOptions<String> {
        BuildImageOptions {
            dockerfile: config.dockerfile().to_string(),
            t: tag.to_string(),
            platform: platform.to_string(),
            target: config.target.clone().unwrap_or_default(),
            buildargs: config
                .build_args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            labels: config
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            nocache: config.no_cache,
            rm: true,
            ..Default::default()
        }
    }

    fn credentials(entry: Option<&CredentialEntry>) -> Option<DockerCredentials> {
        entry.map(|e| DockerCredentials {
            username: Some(e.principal.clone()),
            password: Some(e.secret.expose().to_string()),
            serveraddress: Some(e.address.clone()),
            ..Default::default()
        })
    }

    /// Tag the local image as `target` and push it through the daemon.
    async fn push_one(
        &self,
        crane: &Crane,
        raw: &RawArtifact,
        target: &ImageReference,
        credentials: Option<&CredentialEntry>,
    ) -> Result<Digest> {
        let ArtifactContent::DaemonImage { tag: local, .. } = &raw.content else {
            return Err(Error::Internal(format!(
                "docker cannot push {:?} content",
                raw.content
            )));
        };
        let tag = target.tag().unwrap_or(shipyard_core::reference::DEFAULT_TAG);
        let repository = target.name();

        self.docker
            .tag_image(
                local,
                Some(TagImageOptions {
                    repo: repository.clone(),
                    tag: tag.to_string(),
                }),
            )
            .await
            .map_err(|e| Error::Internal(format!("failed to tag {}: {}", local, e)))?;

        let mut stream = self.docker.push_image(
            &repository,
            Some(PushImageOptions {
                tag: tag.to_string(),
            }),
            Self::credentials(credentials),
        );

        let mut digest = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(push_failure(target, error));
                    }
                    if let Some(status) = info.status {
                        debug!(status = %status, "Push progress");
                        if let Some(d) = parse_digest(&status) {
                            digest = Some(d);
                        }
                    }
                }
                Err(e) => return Err(push_failure(target, e.to_string())),
            }
        }

        match digest {
            Some(digest) => Ok(digest),
            None => crane.digest(&target.to_string()).await,
        }
    }
}

fn push_failure(target: &ImageReference, message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("unauthorized") || lower.contains("denied") || lower.contains("authentication required") {
        Error::Auth {
            registry: target.registry().to_string(),
            message,
        }
    } else {
        Error::Push {
            target: target.to_string(),
            message,
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn build(
        &self,
        id: BuildId,
        config: &BackendConfig,
        platform: &Platform,
    ) -> Result<RawArtifact> {
        let BackendConfig::Docker(docker) = config else {
            return Err(config.mismatch(BackendKind::Docker));
        };

        let tag = Self::local_tag(config, id, platform);
        let context = context_tarball(docker.context.clone()).await?;
        let size = context.len();
        info!(context = %docker.context.display(), platform = %platform, tag = %tag, size, "docker build");

        let mut stream = self.docker.build_image(
            Self::build_options(docker, &tag, platform),
            None,
            Some(Bytes::from(context)),
        );

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(Error::Internal(error));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!(platform = %platform, "{}", line);
                        }
                    }
                    if let Some(id) = info.aux.and_then(|aux| aux.id) {
                        image_id = Some(id);
                    }
                }
                Err(e) => return Err(Error::Internal(e.to_string())),
            }
        }

        let inspect = self
            .docker
            .inspect_image(&tag)
            .await
            .map_err(|e| Error::Internal(format!("built image {} not found: {}", tag, e)))?;
        let image_id = image_id
            .or(inspect.id)
            .ok_or_else(|| Error::Internal(format!("no image id reported for {}", tag)))?;

        Ok(RawArtifact {
            kind: BackendKind::Docker,
            platform: platform.clone(),
            digest: Digest::parse(&image_id).map_err(|_| {
                Error::Internal(format!("daemon reported an invalid image id: {}", image_id))
            })?,
            size: inspect.size.unwrap_or_default().max(0) as u64,
            content: ArtifactContent::DaemonImage { id: image_id, tag },
        })
    }

    async fn login(&self, credentials: &CredentialEntry) -> Result<()> {
        // The daemon takes credentials per push; crane needs them for
        // manifest lists and aliases.
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
            let digest = self
                .push_one(&crane, &artifact.manifests()[0], target, credentials)
                .await?;
            return Ok(PublishedRef::new(target, digest));
        }

        let mut children = Vec::with_capacity(artifact.manifests().len());
        for raw in artifact.manifests() {
            let child = child_target(target, &raw.platform)?;
            let digest = self.push_one(&crane, raw, &child, credentials).await?;
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
    use shipyard_core::credential::Secret;

    #[test]
    fn test_build_options() {
        let mut config = DockerConfig::new("services/api");
        config.dockerfile = Some("build/Dockerfile".to_string());
        config.build_args.insert("VERSION".to_string(), "1.2.3".to_string());
        config.target = Some("runtime".to_string());

        let arm = Platform::new("linux", "arm64");
        let options = DockerBackend::build_options(&config, "api:abc-arm64", &arm);

        assert_eq!(options.dockerfile, "build/Dockerfile");
        assert_eq!(options.t, "api:abc-arm64");
        assert_eq!(options.platform, "linux/arm64");
        assert_eq!(options.target, "runtime");
        assert_eq!(options.buildargs.get("VERSION"), Some(&"1.2.3".to_string()));
        assert!(options.rm);
        assert!(!options.nocache);
    }

    #[test]
    fn test_local_tags_differ_per_platform() {
        let config = BackendConfig::Docker(DockerConfig::new("api"));
        let id = BuildId::new();
        let amd = DockerBackend::local_tag(&config, id, &Platform::new("linux", "amd64"));
        let arm = DockerBackend::local_tag(&config, id, &Platform::new("linux", "arm64"));

        assert_ne!(amd, arm);
        assert!(amd.starts_with("api:"));
        assert!(amd.ends_with("-amd64"));
    }

    #[test]
    fn test_credentials_mapping() {
        let entry = CredentialEntry {
            address: "docker.io".to_string(),
            principal: "user".to_string(),
            secret: Secret::new("pass"),
        };
        let creds = DockerBackend::credentials(Some(&entry)).unwrap();
        assert_eq!(creds.username.as_deref(), Some("user"));
        assert_eq!(creds.password.as_deref(), Some("pass"));
        assert_eq!(creds.serveraddress.as_deref(), Some("docker.io"));
        assert!(DockerBackend::credentials(None).is_none());
    }

    #[test]
    fn test_push_failure_classification() {
        let target = ImageReference::parse("docker.io/x/y:tag").unwrap();
        assert!(matches!(
            push_failure(&target, "unauthorized: incorrect username or password".to_string()),
            Error::Auth { .. }
        ));
        assert!(matches!(
            push_failure(&target, "blob upload unknown".to_string()),
            Error::Push { .. }
        ));
    }
}

/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_build_scratch_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Dockerfile"),
            "FROM scratch\nCOPY hello.txt /hello.txt\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello").unwrap();

        let backend = DockerBackend::new(&BackendSettings::new(dir.path())).unwrap();
        let config = BackendConfig::Docker(DockerConfig::new(dir.path()));
        let artifact = backend
            .build(BuildId::new(), &config, &Platform::new("linux", "amd64"))
            .await
            .unwrap();

        assert_eq!(artifact.kind, BackendKind::Docker);
        assert_eq!(artifact.digest.algorithm(), "sha256");
        assert!(matches!(artifact.content, ArtifactContent::DaemonImage { .. }));
    }
}
