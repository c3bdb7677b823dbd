//! Error types for Shipyard.

use thiserror::Error;

use crate::artifact::PublishedRef;
use crate::platform::Platform;
use crate::scan::{Finding, Severity};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("build failed for {platform}: {message}")]
    Build { platform: Platform, message: String },

    #[error("scan gate failed: {} finding(s) at or above {cutoff}", findings.len())]
    ScanGate {
        cutoff: Severity,
        findings: Vec<Finding>,
    },

    #[error("authentication failed for {registry}: {message}")]
    Auth { registry: String, message: String },

    #[error("push to {target} failed: {message}")]
    Push { target: String, message: String },

    #[error("published {} but {} alias(es) failed: {}", published.address, failures.len(), format_alias_failures(failures))]
    AliasPush {
        published: Box<PublishedRef>,
        failures: Vec<AliasFailure>,
    },

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("not built: {0}")]
    NotBuilt(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// An extra tag that could not be pointed at the published digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasFailure {
    pub target: String,
    pub message: String,
}

fn format_alias_failures(failures: &[AliasFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.target, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Pipeline stage this error belongs to, used when reporting failures.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Build { .. } => "build",
            Error::ScanGate { .. } | Error::Scan(_) => "scan",
            Error::Auth { .. } => "auth",
            Error::Push { .. } | Error::AliasPush { .. } => "publish",
            Error::NotBuilt(_) => "query",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Attach platform context to a failure raised while building for
    /// `platform`.
    ///
    /// Configuration errors keep their kind and gain the platform in their
    /// message; cancellation and build errors pass through. Everything else
    /// becomes a build error for `platform`.
    pub fn for_platform(self, platform: &Platform) -> Self {
        match self {
            Error::Config(message) => Error::Config(format!("{}: {}", platform, message)),
            Error::Build { .. } | Error::Cancelled => self,
            Error::Internal(message) => Error::Build {
                platform: platform.clone(),
                message,
            },
            other => Error::Build {
                platform: platform.clone(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
