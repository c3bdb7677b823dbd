//! Where registry passwords come from.
//!
//! Definitions name a source rather than embedding the secret, so a
//! `shipyard.kdl` can be committed next to the code it builds.

use crate::{ConfigError, ConfigResult};
use shipyard_core::Secret;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Environment variable.
    Env(String),
    /// File whose contents (minus trailing newline) are the secret.
    File(PathBuf),
    /// Inline value. Only sensible for local registries and tests.
    Literal(String),
}

impl SecretSource {
    /// Read the secret. `registry` names the consumer in error messages.
    pub fn resolve(&self, registry: &str) -> ConfigResult<Secret> {
        let missing = |message: String| ConfigError::MissingSecret {
            registry: registry.to_string(),
            message,
        };

        let value = match self {
            SecretSource::Env(name) => std::env::var(name)
                .map_err(|_| missing(format!("environment variable {} is not set", name)))?,
            SecretSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| missing(format!("cannot read {}: {}", path.display(), e)))?
                .trim_end_matches(['\r', '\n'])
                .to_string(),
            SecretSource::Literal(value) => value.clone(),
        };

        if value.is_empty() {
            return Err(missing("secret is empty".to_string()));
        }
        Ok(Secret::new(value))
    }

    pub fn describe(&self) -> String {
        match self {
            SecretSource::Env(name) => format!("env:{}", name),
            SecretSource::File(path) => format!("file:{}", path.display()),
            SecretSource::Literal(_) => "inline".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_source_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s3cret\n").unwrap();

        let secret = SecretSource::File(path).resolve("ghcr.io").unwrap();
        assert_eq!(secret.expose(), "s3cret");
    }

    #[test]
    fn test_missing_env_is_reported() {
        let err = SecretSource::Env("SHIPYARD_TEST_UNSET_TOKEN_9F2A".to_string())
            .resolve("docker.io")
            .unwrap_err();
        match err {
            ConfigError::MissingSecret { registry, message } => {
                assert_eq!(registry, "docker.io");
                assert!(message.contains("SHIPYARD_TEST_UNSET_TOKEN_9F2A"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(SecretSource::Literal(String::new()).resolve("r").is_err());
        assert_eq!(
            SecretSource::Literal("x".to_string()).resolve("r").unwrap().expose(),
            "x"
        );
    }

    #[test]
    fn test_describe_hides_literal() {
        assert_eq!(SecretSource::Literal("hunter2".to_string()).describe(), "inline");
        assert_eq!(SecretSource::Env("TOKEN".to_string()).describe(), "env:TOKEN");
    }
}
