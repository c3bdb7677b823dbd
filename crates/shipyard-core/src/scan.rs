//! Vulnerability reports, the scan gate, and the scanner trait.
//!
//! The gate is a pure policy: given a report and an optional severity cutoff
//! it decides whether publishing may proceed. Running the scanner is the job
//! of a [`Scanner`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::artifact::ArtifactContent;
use crate::credential::CredentialEntry;
use crate::{Error, Result};

/// Vulnerability severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Scanner could not rate the finding. Ranked lowest, as grype does.
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Unknown,
        Severity::Negligible,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Negligible => "negligible",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "unknown" => Ok(Severity::Unknown),
            "negligible" => Ok(Severity::Negligible),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(Error::Config(format!("unknown severity: '{}'", other))),
        }
    }
}

/// One vulnerability reported by a scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Advisory id, e.g. `CVE-2024-12345` or `GHSA-...`.
    pub id: String,
    pub severity: Severity,
    /// Affected package name.
    pub package: String,
    pub description: String,
    pub installed_version: Option<String>,
    /// Versions that fix the vulnerability, if any are known.
    pub fixed_versions: Vec<String>,
}

impl Finding {
    pub fn new(id: impl Into<String>, severity: Severity, package: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            severity,
            package: package.into(),
            description: String::new(),
            installed_version: None,
            fixed_versions: Vec::new(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.severity, self.package)?;
        if let Some(version) = &self.installed_version {
            write!(f, " {}", version)?;
        }
        if !self.fixed_versions.is_empty() {
            write!(f, " (fixed in {})", self.fixed_versions.join(", "))?;
        }
        Ok(())
    }
}

/// Count of findings per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub negligible: usize,
    pub unknown: usize,
    pub total: usize,
}

/// Scanner output. Never mutated once produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    findings: Vec<Finding>,
    /// Human-readable report in the requested output format.
    rendered: Option<String>,
}

impl ScanReport {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            rendered: None,
        }
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered = Some(rendered.into());
        self
    }

    /// Merge several reports (one per platform) into one, dropping findings
    /// already seen for the same id and package.
    pub fn merge(reports: impl IntoIterator<Item = ScanReport>) -> Self {
        let mut findings: Vec<Finding> = Vec::new();
        let mut rendered: Vec<String> = Vec::new();

        for report in reports {
            for finding in report.findings {
                if !findings
                    .iter()
                    .any(|f| f.id == finding.id && f.package == finding.package)
                {
                    findings.push(finding);
                }
            }
            if let Some(r) = report.rendered {
                rendered.push(r);
            }
        }

        Self {
            findings,
            rendered: if rendered.is_empty() {
                None
            } else {
                Some(rendered.join("\n"))
            },
        }
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn rendered(&self) -> Option<&str> {
        self.rendered.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn summary(&self) -> ScanSummary {
        let mut summary = ScanSummary::default();
        for finding in &self.findings {
            match finding.severity {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
                Severity::Negligible => summary.negligible += 1,
                Severity::Unknown => summary.unknown += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Most severe finding, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Outcome of evaluating a report against a cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    /// Findings at or above the cutoff, in report order.
    Fail(Vec<Finding>),
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        matches!(self, GateDecision::Pass)
    }
}

/// Decide whether `report` passes `cutoff`.
///
/// The cutoff is inclusive: a finding exactly at the cutoff fails. No cutoff
/// and an empty report both pass.
pub fn evaluate(report: &ScanReport, cutoff: Option<Severity>) -> GateDecision {
    let Some(cutoff) = cutoff else {
        return GateDecision::Pass;
    };

    let offending: Vec<Finding> = report
        .findings
        .iter()
        .filter(|f| f.severity >= cutoff)
        .cloned()
        .collect();

    if offending.is_empty() {
        GateDecision::Pass
    } else {
        GateDecision::Fail(offending)
    }
}

/// Scanner report format, handed to the scanner unexamined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFormat(String);

impl OutputFormat {
    pub fn new(format: impl Into<String>) -> Self {
        Self(format.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self("table".to_string())
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scan gate bound to a pipeline, evaluated at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanGate {
    pub cutoff: Option<Severity>,
    pub output_format: OutputFormat,
    /// When false the scan runs and is reported but never blocks publish.
    pub enforce: bool,
}

impl ScanGate {
    pub fn new(cutoff: Option<Severity>, output_format: Option<OutputFormat>) -> Self {
        Self {
            cutoff,
            output_format: output_format.unwrap_or_default(),
            enforce: true,
        }
    }

    pub fn report_only(mut self) -> Self {
        self.enforce = false;
        self
    }

    pub fn evaluate(&self, report: &ScanReport) -> GateDecision {
        evaluate(report, self.cutoff)
    }

    /// Evaluate and turn an enforced failure into [`Error::ScanGate`].
    pub fn check(&self, report: &ScanReport) -> Result<GateDecision> {
        match (self.evaluate(report), self.cutoff) {
            (GateDecision::Fail(findings), Some(cutoff)) if self.enforce => {
                Err(Error::ScanGate { cutoff, findings })
            }
            (decision, _) => Ok(decision),
        }
    }
}

/// What a scanner should look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ScanTarget {
    /// Image in a registry.
    Registry { reference: String },
    /// Image held by the local Docker daemon.
    Daemon { reference: String },
    /// OCI layout tarball on disk.
    OciArchive { path: PathBuf },
    /// Directory tree on disk.
    Directory { path: PathBuf },
    /// Any other file (e.g. a chart archive).
    File { path: PathBuf },
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::Registry { reference } => write!(f, "registry:{}", reference),
            ScanTarget::Daemon { reference } => write!(f, "docker:{}", reference),
            ScanTarget::OciArchive { path } => write!(f, "oci-archive:{}", path.display()),
            ScanTarget::Directory { path } => write!(f, "dir:{}", path.display()),
            ScanTarget::File { path } => write!(f, "file:{}", path.display()),
        }
    }
}

impl From<&ArtifactContent> for ScanTarget {
    fn from(content: &ArtifactContent) -> Self {
        match content {
            ArtifactContent::OciArchive { path } => ScanTarget::OciArchive { path: path.clone() },
            ArtifactContent::Directory { path } => ScanTarget::Directory { path: path.clone() },
            ArtifactContent::ChartArchive { path } => ScanTarget::File { path: path.clone() },
            ArtifactContent::DaemonImage { tag, .. } => ScanTarget::Daemon {
                reference: tag.clone(),
            },
        }
    }
}

/// Vulnerability scanner adapter.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Name of this scanner.
    fn name(&self) -> &'static str;

    /// Scan `target`, rendering the human-readable report in `format`.
    /// `credentials` are for pulling registry targets.
    async fn scan(
        &self,
        target: &ScanTarget,
        format: &OutputFormat,
        credentials: Option<&CredentialEntry>,
    ) -> Result<ScanReport>;
}
