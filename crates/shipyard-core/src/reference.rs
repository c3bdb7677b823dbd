//! Registry references (`registry/repository:tag@digest`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Registry used when a reference names none, as Docker does.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a publish target names none.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed registry reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = |why: &str| Error::Config(format!("malformed reference '{}': {}", input, why));

        let trimmed = input.trim();
        let rest = trimmed.strip_prefix("oci://").unwrap_or(trimmed);
        if rest.is_empty() {
            return Err(malformed("empty"));
        }

        let (rest, digest) = match rest.split_once('@') {
            Some((name, digest)) => {
                if !valid_digest(digest) {
                    return Err(malformed("invalid digest"));
                }
                (name, Some(digest.to_string()))
            }
            None => (rest, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports.
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&rest[..colon], Some(rest[colon + 1..].to_string()))
            }
            _ => (rest, None),
        };

        if let Some(tag) = &tag {
            if !valid_tag(tag) {
                return Err(malformed("invalid tag"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder)) if looks_like_registry(first) => {
                (first.to_string(), remainder.to_string())
            }
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if !valid_repository(&repository) {
            return Err(malformed("invalid repository name"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host, used for credential lookup.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository` without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Last path component of the repository (chart or image name).
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Repository path without its last component (the OCI namespace a
    /// chart is pushed into).
    pub fn namespace(&self) -> String {
        match self.repository.rsplit_once('/') {
            Some((parent, _)) => format!("{}/{}", self.registry, parent),
            None => self.registry.clone(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !valid_tag(tag) {
            return Err(Error::Config(format!("invalid tag '{}'", tag)));
        }
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Fill in the default tag when neither tag nor digest is given.
    pub fn or_default_tag(self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            Self {
                tag: Some(DEFAULT_TAG.to_string()),
                ..self
            }
        } else {
            self
        }
    }

    /// Resolve an extra tag relative to this reference.
    ///
    /// A bare tag (`latest`) aliases the same repository; anything with a
    /// `/` is a full reference of its own.
    pub fn resolve_alias(&self, alias: &str) -> Result<Self> {
        let alias = alias.trim();
        if alias.contains('/') {
            Self::parse(alias).map(Self::or_default_tag)
        } else {
            self.with_tag(alias)
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        })
}

fn valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reference() {
        let r = ImageReference::parse("ghcr.io/acme/app:v1").unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.repository(), "acme/app");
        assert_eq!(r.tag(), Some("v1"));
        assert_eq!(r.digest(), None);
        assert_eq!(r.to_string(), "ghcr.io/acme/app:v1");
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "app");
        assert_eq!(r.tag(), None);

        let r = ImageReference::parse("registry.example.com:8443/team/app:1.2.3").unwrap();
        assert_eq!(r.registry(), "registry.example.com:8443");
        assert_eq!(r.tag(), Some("1.2.3"));
    }

    #[test]
    fn test_docker_hub_defaults() {
        let r = ImageReference::parse("nginx:latest").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "library/nginx");

        let r = ImageReference::parse("x/y:tag").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "x/y");

        let r = ImageReference::parse("docker.io/x/y:tag").unwrap();
        assert_eq!(r.registry(), "docker.io");
        assert_eq!(r.repository(), "x/y");
    }

    #[test]
    fn test_oci_scheme_and_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageReference::parse(&format!("oci://ghcr.io/acme/charts/app@{}", digest)).unwrap();
        assert_eq!(r.registry(), "ghcr.io");
        assert_eq!(r.digest(), Some(digest.as_str()));
        assert_eq!(r.namespace(), "ghcr.io/acme/charts");
        assert_eq!(r.short_name(), "app");
    }

    #[test]
    fn test_malformed_references() {
        for bad in [
            "",
            "ghcr.io/acme/App:v1",
            "ghcr.io/acme/app:",
            "ghcr.io/acme/app:-bad",
            "ghcr.io//app:v1",
            "ghcr.io/acme/app@sha256:zz",
            "ghcr.io/acme/app@nodigest",
        ] {
            assert!(
                matches!(ImageReference::parse(bad), Err(Error::Config(_))),
                "expected config error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_resolve_alias() {
        let primary = ImageReference::parse("ghcr.io/acme/app:v1").unwrap();

        let bare = primary.resolve_alias("latest").unwrap();
        assert_eq!(bare.to_string(), "ghcr.io/acme/app:latest");

        let full = primary.resolve_alias("quay.io/acme/app:stable").unwrap();
        assert_eq!(full.registry(), "quay.io");

        let untagged = primary.resolve_alias("quay.io/acme/app").unwrap();
        assert_eq!(untagged.tag(), Some("latest"));

        assert!(primary.resolve_alias("not a tag").is_err());
    }

    #[test]
    fn test_default_tag() {
        let r = ImageReference::parse("ghcr.io/acme/app").unwrap().or_default_tag();
        assert_eq!(r.tag(), Some(DEFAULT_TAG));

        let pinned = ImageReference::parse("ghcr.io/acme/app:v2").unwrap().or_default_tag();
        assert_eq!(pinned.tag(), Some("v2"));
    }
}
