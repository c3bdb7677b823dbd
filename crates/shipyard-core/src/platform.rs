//! Target platforms and platform-set normalization.
//!
//! A [`PlatformSet`] is what a multi-platform build fans out over. Its order
//! matters: the first entry is the primary platform recorded in the
//! manifest list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// An `os/arch[/variant]` build target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
    os: String,
    arch: String,
    variant: Option<String>,
}

impl Platform {
    /// Create a platform, canonicalizing the architecture name.
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into().to_lowercase(),
            arch: canonical_arch(&arch.into().to_lowercase()),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into().to_lowercase());
        self
    }

    /// The platform of the machine running the pipeline. Container
    /// artifacts are always Linux, so only the architecture is taken from
    /// the host.
    pub fn host() -> Self {
        Self::new("linux", std::env::consts::ARCH)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

fn canonical_arch(arch: &str) -> String {
    match arch {
        "x86_64" | "x86-64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "i386" | "i686" => "386".to_string(),
        other => other.to_string(),
    }
}

fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('/').map(str::trim).collect();

        if !parts.iter().all(|p| valid_component(p)) {
            return Err(Error::Config(format!("invalid platform: '{}'", s)));
        }

        match parts.as_slice() {
            [arch] => Ok(Platform::new("linux", *arch)),
            [os, arch] => Ok(Platform::new(*os, *arch)),
            [os, arch, variant] => Ok(Platform::new(*os, *arch).with_variant(*variant)),
            _ => Err(Error::Config(format!("invalid platform: '{}'", s))),
        }
    }
}

impl TryFrom<String> for Platform {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> Self {
        platform.to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Normalized, de-duplicated, non-empty and ordered set of platforms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlatformList")]
pub struct PlatformSet {
    platforms: Vec<Platform>,
}

/// Serialized form of a [`PlatformSet`], checked on the way in.
#[derive(Deserialize)]
struct PlatformList {
    platforms: Vec<Platform>,
}

impl TryFrom<PlatformList> for PlatformSet {
    type Error = Error;

    fn try_from(list: PlatformList) -> Result<Self> {
        Self::from_platforms(list.platforms)
    }
}

impl PlatformSet {
    /// Normalize list-form platform specs.
    ///
    /// Each entry may itself be comma-separated. Entries are trimmed, empty
    /// entries dropped, and duplicates removed keeping the first occurrence.
    /// When nothing remains the set is just `default`.
    pub fn normalize<I, S>(specs: I, default: &Platform) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut platforms: Vec<Platform> = Vec::new();

        for spec in specs {
            for item in spec.as_ref().split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let platform: Platform = item.parse()?;
                if !platforms.contains(&platform) {
                    platforms.push(platform);
                }
            }
        }

        if platforms.is_empty() {
            platforms.push(default.clone());
        }

        Ok(Self { platforms })
    }

    /// Normalize a single comma-separated spec.
    pub fn parse(spec: &str, default: &Platform) -> Result<Self> {
        Self::normalize([spec], default)
    }

    /// An exact list of already-parsed platforms. Unlike [`normalize`] there
    /// is no default: the list must be non-empty and free of duplicates.
    ///
    /// [`normalize`]: PlatformSet::normalize
    pub fn from_platforms(platforms: Vec<Platform>) -> Result<Self> {
        if platforms.is_empty() {
            return Err(Error::Config("platform set is empty".to_string()));
        }
        if let Some(dup) = platforms
            .iter()
            .enumerate()
            .find_map(|(i, p)| platforms[..i].contains(p).then_some(p))
        {
            return Err(Error::Config(format!("duplicate platform: {}", dup)));
        }
        Ok(Self { platforms })
    }

    pub fn single(platform: Platform) -> Self {
        Self {
            platforms: vec![platform],
        }
    }

    /// The first platform; primary entry of a manifest list.
    pub fn primary(&self) -> &Platform {
        &self.platforms[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Platform> {
        self.platforms.iter()
    }

    pub fn as_slice(&self) -> &[Platform] {
        &self.platforms
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    pub fn is_multi(&self) -> bool {
        self.platforms.len() > 1
    }

    pub fn contains(&self, platform: &Platform) -> bool {
        self.platforms.contains(platform)
    }
}

impl<'a> IntoIterator for &'a PlatformSet {
    type Item = &'a Platform;
    type IntoIter = std::slice::Iter<'a, Platform>;

    fn into_iter(self) -> Self::IntoIter {
        self.platforms.iter()
    }
}

impl fmt::Display for PlatformSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.platforms.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", joined.join(","))
    }
}
