//! Build outputs: raw per-platform artifacts, the assembled handle, and the
//! reference produced by a publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::id::BuildId;
use crate::platform::{Platform, PlatformSet};
use crate::reference::ImageReference;
use crate::{Error, Result};

pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Which backend produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Apko,
    Melange,
    Docker,
    Helm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Apko => "apko",
            BackendKind::Melange => "melange",
            BackendKind::Docker => "docker",
            BackendKind::Helm => "helm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "apko" => Ok(BackendKind::Apko),
            "melange" => Ok(BackendKind::Melange),
            "docker" => Ok(BackendKind::Docker),
            "helm" => Ok(BackendKind::Helm),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// A content digest such as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// SHA-256 of `bytes`.
    pub fn sha256(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    /// SHA-256 of a file's contents, streamed. Blocking.
    pub fn sha256_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("sha256:{}", hex::encode(hasher.finalize()))))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once(':') {
            Some((algorithm, hex))
                if !algorithm.is_empty()
                    && !hex.is_empty()
                    && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self(s.to_lowercase()))
            }
            _ => Err(Error::Config(format!("invalid digest: '{}'", s))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Where a backend left the bytes of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ArtifactContent {
    /// OCI image layout tarball (apko).
    OciArchive { path: PathBuf },
    /// Directory tree, e.g. a melange package repository.
    Directory { path: PathBuf },
    /// Packaged Helm chart (`.tgz`).
    ChartArchive { path: PathBuf },
    /// Image held by the local Docker daemon.
    DaemonImage { id: String, tag: String },
}

impl ArtifactContent {
    /// Filesystem location, when the content lives on disk.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ArtifactContent::OciArchive { path }
            | ArtifactContent::Directory { path }
            | ArtifactContent::ChartArchive { path } => Some(path),
            ArtifactContent::DaemonImage { .. } => None,
        }
    }
}

/// The output of one backend build for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub kind: BackendKind,
    pub platform: Platform,
    pub digest: Digest,
    pub size: u64,
    pub content: ArtifactContent,
}

#[derive(Serialize)]
struct IndexPlatform<'a> {
    architecture: &'a str,
    os: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<&'a str>,
}

#[derive(Serialize)]
struct IndexEntry<'a> {
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    digest: &'a str,
    size: u64,
    platform: IndexPlatform<'a>,
}

#[derive(Serialize)]
struct ImageIndex<'a> {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: &'static str,
    manifests: Vec<IndexEntry<'a>>,
}

/// Canonical OCI image index listing `artifacts` in order.
pub fn image_index_json(artifacts: &[RawArtifact]) -> Vec<u8> {
    let index = ImageIndex {
        schema_version: 2,
        media_type: OCI_INDEX_MEDIA_TYPE,
        manifests: artifacts
            .iter()
            .map(|a| IndexEntry {
                media_type: OCI_MANIFEST_MEDIA_TYPE,
                digest: a.digest.as_str(),
                size: a.size,
                platform: IndexPlatform {
                    architecture: a.platform.arch(),
                    os: a.platform.os(),
                    variant: a.platform.variant(),
                },
            })
            .collect(),
    };
    // Serializing plain structs of strings and integers cannot fail.
    serde_json::to_vec(&index).unwrap_or_default()
}

/// Immutable result of a `build` call.
///
/// A multi-platform handle is manifest-list shaped: its digest covers the
/// child digests in platform order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HandleFields")]
pub struct ArtifactHandle {
    id: BuildId,
    kind: BackendKind,
    reference: String,
    platforms: PlatformSet,
    manifests: Vec<RawArtifact>,
    digest: Digest,
    created_at: DateTime<Utc>,
}

/// Serialized form of an [`ArtifactHandle`]; manifests must line up with
/// the platform set.
#[derive(Deserialize)]
struct HandleFields {
    id: BuildId,
    kind: BackendKind,
    reference: String,
    platforms: PlatformSet,
    manifests: Vec<RawArtifact>,
    digest: Digest,
    created_at: DateTime<Utc>,
}

impl TryFrom<HandleFields> for ArtifactHandle {
    type Error = Error;

    fn try_from(f: HandleFields) -> Result<Self> {
        let lined_up = f.manifests.len() == f.platforms.len()
            && f.manifests
                .iter()
                .zip(f.platforms.iter())
                .all(|(a, p)| &a.platform == p && a.kind == f.kind);
        if !lined_up {
            return Err(Error::Internal(
                "artifact manifests do not match the platform set".to_string(),
            ));
        }

        Ok(Self {
            id: f.id,
            kind: f.kind,
            reference: f.reference,
            platforms: f.platforms,
            manifests: f.manifests,
            digest: f.digest,
            created_at: f.created_at,
        })
    }
}

impl ArtifactHandle {
    /// Assemble a handle from per-platform artifacts, in platform order.
    pub fn assemble(id: BuildId, reference: impl Into<String>, manifests: Vec<RawArtifact>) -> Result<Self> {
        let first = manifests
            .first()
            .ok_or_else(|| Error::Internal("no artifacts to assemble".to_string()))?;
        let kind = first.kind;

        if let Some(other) = manifests.iter().find(|a| a.kind != kind) {
            return Err(Error::Internal(format!(
                "cannot assemble {} and {} artifacts into one handle",
                kind, other.kind
            )));
        }

        let platforms =
            PlatformSet::normalize(manifests.iter().map(|a| a.platform.to_string()), &first.platform)?;
        if platforms.len() != manifests.len() {
            return Err(Error::Internal(
                "duplicate platform in build results".to_string(),
            ));
        }

        let digest = if manifests.len() == 1 {
            first.digest.clone()
        } else {
            Digest::sha256(&image_index_json(&manifests))
        };

        Ok(Self {
            id,
            kind,
            reference: reference.into(),
            platforms,
            manifests,
            digest,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> BuildId {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Platform-independent local reference of the build.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn platforms(&self) -> &PlatformSet {
        &self.platforms
    }

    pub fn manifests(&self) -> &[RawArtifact] {
        &self.manifests
    }

    /// Manifest-list digest for multi-platform builds, otherwise the single
    /// artifact's digest.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn is_multi_platform(&self) -> bool {
        self.manifests.len() > 1
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Platform → child digest mapping, in platform order.
    pub fn platform_digests(&self) -> Vec<(&Platform, &Digest)> {
        self.manifests
            .iter()
            .map(|a| (&a.platform, &a.digest))
            .collect()
    }

    pub fn manifest_for(&self, platform: &Platform) -> Option<&RawArtifact> {
        self.manifests.iter().find(|a| &a.platform == platform)
    }

    /// Raw content for `platform`, or for the primary platform.
    pub fn contents(&self, platform: Option<&Platform>) -> Option<&ArtifactContent> {
        match platform {
            Some(p) => self.manifest_for(p).map(|a| &a.content),
            None => self.manifests.first().map(|a| &a.content),
        }
    }
}

/// Terminal output of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRef {
    /// Fully qualified reference by digest (`registry/repo@sha256:...`).
    pub reference: String,
    pub digest: Digest,
    /// The tagged address that was pushed (`registry/repo:tag`).
    pub address: String,
    /// Extra tags pointed at the same digest.
    pub aliases: Vec<String>,
}

impl PublishedRef {
    pub fn new(target: &ImageReference, digest: Digest) -> Self {
        Self {
            reference: target.with_digest(digest.as_str()).to_string(),
            digest,
            address: target.to_string(),
            aliases: Vec::new(),
        }
    }

    /// Registry host of the pushed address.
    pub fn registry(&self) -> &str {
        self.address.split('/').next().unwrap_or_default()
    }
}
