//! Registry credentials carried by a pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A secret value. Never printed by `Debug` or `Display`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the raw value. Only backends handing it to a tool should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credentials for one registry address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    /// Registry host, e.g. `docker.io` or `localhost:5000`.
    pub address: String,
    /// Username or robot account.
    pub principal: String,
    pub secret: Secret,
}

/// Normalize a registry address for exact-match lookup.
///
/// Strips surrounding whitespace, a scheme (`oci://`, `https://`, `http://`)
/// and trailing slashes. Nothing else is rewritten: `docker.io` and
/// `index.docker.io` are different addresses.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let without_scheme = ["oci://", "https://", "http://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(scheme))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Insertion-ordered credential set, at most one entry per address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialContext {
    entries: Vec<CredentialEntry>,
}

impl CredentialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with the entry for `address` upserted.
    ///
    /// A later entry for the same address replaces the earlier one in place.
    pub fn with(
        &self,
        address: &str,
        principal: impl Into<String>,
        secret: impl Into<Secret>,
    ) -> Self {
        let entry = CredentialEntry {
            address: normalize_address(address),
            principal: principal.into(),
            secret: secret.into(),
        };

        let mut entries = self.entries.clone();
        match entries.iter_mut().find(|e| e.address == entry.address) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }

        Self { entries }
    }

    /// Exact-match lookup on the registry address.
    pub fn resolve(&self, address: &str) -> Option<&CredentialEntry> {
        let address = normalize_address(address);
        self.entries.iter().find(|e| e.address == address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CredentialEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");

        let entry = CredentialEntry {
            address: "ghcr.io".to_string(),
            principal: "bot".to_string(),
            secret,
        };
        assert!(!format!("{:?}", entry).contains("hunter2"));
    }

    #[test]
    fn test_later_auth_replaces_earlier() {
        let ctx = CredentialContext::new()
            .with("docker.io", "a", "secretA")
            .with("docker.io", "b", "secretB");

        assert_eq!(ctx.len(), 1);
        let entry = ctx.resolve("docker.io").unwrap();
        assert_eq!(entry.principal, "b");
        assert_eq!(entry.secret.expose(), "secretB");
    }

    #[test]
    fn test_replacement_keeps_insertion_order() {
        let ctx = CredentialContext::new()
            .with("ghcr.io", "g", "1")
            .with("docker.io", "d", "2")
            .with("ghcr.io", "g2", "3");

        let addresses: Vec<&str> = ctx.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(addresses, vec!["ghcr.io", "docker.io"]);
        assert_eq!(ctx.resolve("ghcr.io").unwrap().principal, "g2");
    }

    #[test]
    fn test_no_inheritance_across_registries() {
        let ctx = CredentialContext::new().with("ghcr.io", "bot", "token");
        assert!(ctx.resolve("docker.io").is_none());
        assert!(ctx.resolve("ghcr.io.evil.example").is_none());
        assert!(ctx.resolve("index.docker.io").is_none());
    }

    #[test]
    fn test_with_leaves_original_untouched() {
        let base = CredentialContext::new().with("ghcr.io", "bot", "token");
        let branched = base.with("quay.io", "q", "t");

        assert_eq!(base.len(), 1);
        assert_eq!(branched.len(), 2);
        assert!(base.resolve("quay.io").is_none());
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(normalize_address(" oci://ghcr.io/ "), "ghcr.io");
        assert_eq!(normalize_address("https://localhost:5000"), "localhost:5000");

        let ctx = CredentialContext::new().with("https://ghcr.io/", "bot", "token");
        assert_eq!(ctx.resolve("ghcr.io").unwrap().principal, "bot");
    }
}
