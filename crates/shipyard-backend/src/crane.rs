//! Registry operations through `crane`.

use regex::Regex;
use shipyard_core::{CredentialEntry, Digest, Error, ImageReference, Platform, Result};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::TempDir;
use tracing::info;

use crate::process::{ToolCommand, ToolError};

static DIGEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sha256:[0-9a-f]{64}").expect("Invalid regex")
});

/// Last `sha256:` digest mentioned in tool output.
pub fn parse_digest(output: &str) -> Option<Digest> {
    DIGEST_REGEX
        .find_iter(output)
        .last()
        .and_then(|m| Digest::parse(m.as_str()).ok())
}

/// Tag suffix for a per-platform child of a manifest list (`amd64`, `arm-v7`).
pub fn platform_suffix(platform: &Platform) -> String {
    match platform.variant() {
        Some(variant) => format!("{}-{}", platform.arch(), variant),
        None => platform.arch().to_string(),
    }
}

/// Where a per-platform child of `target` is pushed before the index is
/// assembled.
pub fn child_target(target: &ImageReference, platform: &Platform) -> Result<ImageReference> {
    let tag = target.tag().unwrap_or(shipyard_core::reference::DEFAULT_TAG);
    target.with_tag(&format!("{}-{}", tag, platform_suffix(platform)))
}

/// Private registry auth state for a sequence of tool runs.
///
/// A scope is an initially empty Docker config directory under the backend's
/// scratch directory, removed when the scope is dropped. Tools run inside a
/// scope only see the credentials logged in through it, never the user's
/// `~/.docker/config.json`.
#[derive(Debug)]
pub struct AuthScope {
    dir: TempDir,
}

impl AuthScope {
    pub fn new(scratch: &Path) -> Result<Self> {
        std::fs::create_dir_all(scratch)
            .map_err(|e| Error::Internal(format!("failed to create {}: {}", scratch.display(), e)))?;
        let dir = tempfile::Builder::new()
            .prefix("auth-")
            .tempdir_in(scratch)
            .map_err(|e| Error::Internal(format!("failed to create auth scope: {}", e)))?;
        Ok(Self { dir })
    }

    /// Value for `DOCKER_CONFIG`.
    pub fn docker_config(&self) -> &Path {
        self.dir.path()
    }

    /// File for helm's `--registry-config`.
    pub fn helm_registry_config(&self) -> PathBuf {
        self.dir.path().join("helm-registry.json")
    }
}

/// Thin wrapper around the `crane` CLI.
#[derive(Debug, Clone)]
pub struct Crane {
    binary: String,
    docker_config: Option<PathBuf>,
}

impl Default for Crane {
    fn default() -> Self {
        Self::new("crane")
    }
}

impl Crane {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            docker_config: None,
        }
    }

    /// The same crane, reading and writing credentials in `scope` only.
    pub fn in_scope(&self, scope: &AuthScope) -> Self {
        Self {
            binary: self.binary.clone(),
            docker_config: Some(scope.docker_config().to_path_buf()),
        }
    }

    /// A fresh scope holding nothing but `credentials`, and a crane bound to
    /// it. Anonymous sessions get an empty scope. The scope must outlive
    /// every call made through the returned crane.
    pub async fn session(
        &self,
        scratch: &Path,
        credentials: Option<&CredentialEntry>,
    ) -> Result<(AuthScope, Crane)> {
        let scope = AuthScope::new(scratch)?;
        let crane = self.in_scope(&scope);
        if let Some(credentials) = credentials {
            crane.login(credentials).await?;
        }
        Ok((scope, crane))
    }

    fn command(&self) -> ToolCommand {
        let cmd = ToolCommand::new(&self.binary);
        match &self.docker_config {
            Some(dir) => cmd.env("DOCKER_CONFIG", dir.to_string_lossy()),
            None => cmd,
        }
    }

    pub fn login_command(&self, credentials: &CredentialEntry) -> ToolCommand {
        self.command()
            .args(["auth", "login", credentials.address.as_str(), "-u"])
            .arg(&credentials.principal)
            .arg("--password-stdin")
            .stdin_secret(credentials.secret.clone())
    }

    pub async fn login(&self, credentials: &CredentialEntry) -> Result<()> {
        info!(registry = %credentials.address, "crane auth login");
        self.login_command(credentials)
            .run()
            .await
            .map_err(|e| Error::Auth {
                registry: credentials.address.clone(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn push_command(&self, tarball: &Path, target: &ImageReference) -> ToolCommand {
        self.command()
            .arg("push")
            .arg(tarball)
            .arg(target.to_string())
    }

    /// Push an OCI layout tarball; returns the pushed manifest digest.
    pub async fn push(&self, tarball: &Path, target: &ImageReference) -> Result<Digest> {
        let output = self
            .push_command(tarball, target)
            .run()
            .await
            .map_err(|e| push_error(e, target))?;
        self.digest_from(&output.combined(), target).await
    }

    pub fn append_command(&self, layer: &Path, target: &ImageReference) -> ToolCommand {
        self.command()
            .arg("append")
            .arg("-f")
            .arg(layer)
            .arg("-t")
            .arg(target.to_string())
            .arg("--oci-empty-base")
    }

    /// Push `layer` as the single layer of a new image.
    pub async fn append(&self, layer: &Path, target: &ImageReference) -> Result<Digest> {
        let output = self
            .append_command(layer, target)
            .run()
            .await
            .map_err(|e| push_error(e, target))?;
        self.digest_from(&output.combined(), target).await
    }

    pub fn index_command(&self, manifests: &[String], target: &ImageReference) -> ToolCommand {
        self.command()
            .args(["index", "append", "-t"])
            .arg(target.to_string())
            .repeated("-m", manifests.iter().map(String::as_str))
    }

    /// Assemble a manifest list at `target` from pushed child manifests, in
    /// order.
    pub async fn index_append(&self, manifests: &[String], target: &ImageReference) -> Result<Digest> {
        let output = self
            .index_command(manifests, target)
            .run()
            .await
            .map_err(|e| push_error(e, target))?;
        self.digest_from(&output.combined(), target).await
    }

    pub async fn digest(&self, reference: &str) -> Result<Digest> {
        let output = self
            .command()
            .arg("digest")
            .arg(reference)
            .run()
            .await?;
        Digest::parse(output.stdout.trim())
            .map_err(|_| Error::Internal(format!("crane digest returned '{}'", output.stdout.trim())))
    }

    pub fn copy_command(&self, source: &str, target: &ImageReference) -> ToolCommand {
        self.command().arg("copy").arg(source).arg(target.to_string())
    }

    /// Copy `source` (usually a by-digest reference) to `target`.
    pub async fn copy(&self, source: &str, target: &ImageReference) -> Result<()> {
        self.copy_command(source, target)
            .run()
            .await
            .map_err(|e| push_error(e, target))?;
        Ok(())
    }

    async fn digest_from(&self, output: &str, target: &ImageReference) -> Result<Digest> {
        match parse_digest(output) {
            Some(digest) => Ok(digest),
            None => self.digest(&target.to_string()).await,
        }
    }
}

pub(crate) fn push_error(e: ToolError, target: &ImageReference) -> Error {
    e.into_push_error(target.registry(), &target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ImageReference {
        ImageReference::parse("ghcr.io/acme/app:v1").unwrap()
    }

    #[test]
    fn test_parse_digest_takes_last() {
        let a = format!("sha256:{}", "a".repeat(64));
        let b = format!("sha256:{}", "b".repeat(64));
        let output = format!("pushed blob {}\nghcr.io/acme/app@{}\n", a, b);
        assert_eq!(parse_digest(&output).unwrap().as_str(), b);
        assert!(parse_digest("no digest here").is_none());
    }

    #[test]
    fn test_child_target_tags() {
        let amd = Platform::new("linux", "amd64");
        let arm = Platform::new("linux", "arm").with_variant("v7");
        assert_eq!(child_target(&target(), &amd).unwrap().to_string(), "ghcr.io/acme/app:v1-amd64");
        assert_eq!(child_target(&target(), &arm).unwrap().to_string(), "ghcr.io/acme/app:v1-arm-v7");
    }

    #[test]
    fn test_login_uses_password_stdin() {
        let entry = CredentialEntry {
            address: "ghcr.io".to_string(),
            principal: "bot".to_string(),
            secret: "token".into(),
        };
        let cmd = Crane::default().login_command(&entry);
        let args = cmd.arg_strings();
        assert_eq!(args, vec!["auth", "login", "ghcr.io", "-u", "bot", "--password-stdin"]);
        assert!(!args.iter().any(|a| a.contains("token")));
    }

    #[test]
    fn test_scoped_commands_carry_docker_config() {
        let dir = tempfile::tempdir().unwrap();
        let scope = AuthScope::new(dir.path()).unwrap();
        let crane = Crane::default().in_scope(&scope);
        let entry = CredentialEntry {
            address: "ghcr.io".to_string(),
            principal: "bot".to_string(),
            secret: "token".into(),
        };

        let expected = scope.docker_config().to_string_lossy().into_owned();
        assert!(scope.docker_config().starts_with(dir.path()));
        assert_eq!(crane.login_command(&entry).env_value("DOCKER_CONFIG"), Some(expected.as_str()));
        assert_eq!(
            crane.copy_command("ghcr.io/acme/app@sha256:1", &target()).env_value("DOCKER_CONFIG"),
            Some(expected.as_str())
        );
        assert_eq!(Crane::default().login_command(&entry).env_value("DOCKER_CONFIG"), None);
    }

    /// A stand-in `crane` that records `DOCKER_CONFIG` for each call.
    #[cfg(unix)]
    fn fake_crane(dir: &Path) -> (Crane, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let script = dir.join("crane");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1 $DOCKER_CONFIG\" >> {}\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (Crane::new(script.to_string_lossy()), log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sessions_are_private_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (crane, log) = fake_crane(dir.path());
        let scratch = dir.path().join("scratch");
        let entry = CredentialEntry {
            address: "ghcr.io".to_string(),
            principal: "bot".to_string(),
            secret: "token".into(),
        };

        let (first, _) = crane.session(&scratch, Some(&entry)).await.unwrap();
        let (second, _) = crane.session(&scratch, None).await.unwrap();
        let first_dir = first.docker_config().to_path_buf();
        assert_ne!(first_dir, second.docker_config());

        // Only the authenticated session logs in, and into its own scope.
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.trim(), format!("auth {}", first_dir.display()));

        drop(first);
        assert!(!first_dir.exists());
        assert!(second.docker_config().exists());
    }

    #[test]
    fn test_index_command_keeps_manifest_order() {
        let cmd = Crane::default().index_command(
            &["ghcr.io/acme/app@sha256:1".to_string(), "ghcr.io/acme/app@sha256:2".to_string()],
            &target(),
        );
        assert_eq!(
            cmd.arg_strings(),
            vec![
                "index",
                "append",
                "-t",
                "ghcr.io/acme/app:v1",
                "-m",
                "ghcr.io/acme/app@sha256:1",
                "-m",
                "ghcr.io/acme/app@sha256:2"
            ]
        );
    }

    #[test]
    fn test_append_and_copy_commands() {
        let crane = Crane::new("/opt/bin/crane");
        let append = crane.append_command(Path::new("/tmp/layer.tar"), &target());
        assert_eq!(append.program(), "/opt/bin/crane");
        assert_eq!(
            append.arg_strings(),
            vec!["append", "-f", "/tmp/layer.tar", "-t", "ghcr.io/acme/app:v1", "--oci-empty-base"]
        );

        let copy = crane.copy_command("ghcr.io/acme/app@sha256:1", &target());
        assert_eq!(copy.arg_strings(), vec!["copy", "ghcr.io/acme/app@sha256:1", "ghcr.io/acme/app:v1"]);
    }
}
