//! Anchore grype integration.
//!
//! Each scan runs grype once with JSON output to collect findings, and once
//! more in the requested format for the human-readable report.

use async_trait::async_trait;
use serde::Deserialize;
use shipyard_backend::process::ToolCommand;
use shipyard_core::{
    CredentialEntry, Error, Finding, OutputFormat, Result, ScanReport, ScanTarget, Scanner,
    Severity,
};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Scans artifacts with the `grype` CLI.
#[derive(Debug, Clone)]
pub struct GrypeScanner {
    binary: String,
    /// Vulnerability database cache, shared between runs.
    db_cache_dir: Option<PathBuf>,
}

impl Default for GrypeScanner {
    fn default() -> Self {
        Self::new("grype")
    }
}

impl GrypeScanner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            db_cache_dir: None,
        }
    }

    pub fn with_db_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.db_cache_dir = Some(dir.into());
        self
    }

    pub fn scan_command(
        &self,
        target: &ScanTarget,
        format: &str,
        credentials: Option<&CredentialEntry>,
    ) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.binary)
            .arg(target.to_string())
            .args(["-o", format])
            .arg("--quiet");

        if let Some(dir) = &self.db_cache_dir {
            cmd = cmd.env("GRYPE_DB_CACHE_DIR", dir.to_string_lossy());
        }
        if let Some(entry) = credentials {
            cmd = cmd
                .env("GRYPE_REGISTRY_AUTH_AUTHORITY", entry.address.as_str())
                .env("GRYPE_REGISTRY_AUTH_USERNAME", entry.principal.as_str())
                .secret_env("GRYPE_REGISTRY_AUTH_PASSWORD", entry.secret.clone());
        }
        cmd
    }

    async fn run(
        &self,
        target: &ScanTarget,
        format: &str,
        credentials: Option<&CredentialEntry>,
    ) -> Result<String> {
        let output = self
            .scan_command(target, format, credentials)
            .run()
            .await
            .map_err(|e| Error::Scan(e.to_string()))?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl Scanner for GrypeScanner {
    fn name(&self) -> &'static str {
        "grype"
    }

    async fn scan(
        &self,
        target: &ScanTarget,
        format: &OutputFormat,
        credentials: Option<&CredentialEntry>,
    ) -> Result<ScanReport> {
        info!(target = %target, "grype scan");
        let json = self.run(target, "json", credentials).await?;
        let findings = parse_findings(&json)?;
        debug!(target = %target, findings = findings.len(), "grype finished");

        let rendered = if format.as_str() == "json" {
            json
        } else {
            self.run(target, format.as_str(), credentials).await?
        };

        Ok(ScanReport::new(findings).with_rendered(rendered))
    }
}

#[derive(Debug, Deserialize)]
struct GrypeOutput {
    #[serde(default)]
    matches: Vec<GrypeMatch>,
}

#[derive(Debug, Deserialize)]
struct GrypeMatch {
    vulnerability: GrypeVulnerability,
    artifact: GrypeArtifact,
}

#[derive(Debug, Deserialize)]
struct GrypeVulnerability {
    id: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fix: Option<GrypeFix>,
}

#[derive(Debug, Deserialize)]
struct GrypeFix {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GrypeArtifact {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

/// Parse grype's JSON document into findings.
pub fn parse_findings(json: &str) -> Result<Vec<Finding>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let output: GrypeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Scan(format!("failed to parse grype output: {}", e)))?;

    Ok(output.matches.into_iter().map(convert_match).collect())
}

fn convert_match(m: GrypeMatch) -> Finding {
    let severity = match m.vulnerability.severity.as_deref() {
        Some(s) => s.parse().unwrap_or_else(|_| {
            warn!(id = %m.vulnerability.id, severity = s, "unrecognised severity");
            Severity::Unknown
        }),
        None => Severity::Unknown,
    };

    let mut finding = Finding::new(m.vulnerability.id, severity, m.artifact.name);
    finding.description = m.vulnerability.description.unwrap_or_default();
    finding.installed_version = m.artifact.version.filter(|v| !v.is_empty());
    finding.fixed_versions = m.vulnerability.fix.map(|f| f.versions).unwrap_or_default();
    finding
}
