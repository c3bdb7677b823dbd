//! Core domain types and traits for the Shipyard artifact pipeline.
//!
//! This crate contains:
//! - Error taxonomy and build identifiers
//! - Platforms and platform-set normalization
//! - Registry credentials and references
//! - Artifacts, digests and published references
//! - Scan reports, the scan gate and the `Scanner` trait
//! - The `Backend` trait and per-backend configuration

pub mod artifact;
pub mod backend;
pub mod credential;
pub mod error;
pub mod id;
pub mod platform;
pub mod reference;
pub mod scan;

pub use artifact::{ArtifactContent, ArtifactHandle, BackendKind, Digest, PublishedRef, RawArtifact};
pub use backend::{Backend, BackendConfig};
pub use credential::{CredentialContext, CredentialEntry, Secret};
pub use error::{AliasFailure, Error, Result};
pub use id::BuildId;
pub use platform::{Platform, PlatformSet};
pub use reference::ImageReference;
pub use scan::{Finding, GateDecision, OutputFormat, ScanGate, ScanReport, ScanTarget, Scanner, Severity};
