//! Standalone image scan.

use anyhow::{Context, Result, bail};
use clap::Args;
use shipyard_config::{SecretSource, VariableContext, load_pipeline};
use shipyard_core::{
    CredentialEntry, GateDecision, ImageReference, OutputFormat, ScanGate, ScanTarget, Scanner,
    Severity,
};
use shipyard_scanner::GrypeScanner;
use std::path::{Path, PathBuf};
use tracing::info;

use super::definition_dir;

#[derive(Args)]
pub struct ScanArgs {
    /// Image reference to scan
    image: String,

    /// Fail on findings at or above this severity
    #[arg(long)]
    severity: Option<Severity>,

    /// Report format
    #[arg(long, default_value = "table")]
    format: String,

    /// Registry username
    #[arg(long, requires = "password", conflicts_with = "file")]
    username: Option<String>,

    /// Environment variable holding the registry password
    #[arg(long, group = "password", requires = "username")]
    password_env: Option<String>,

    /// File holding the registry password
    #[arg(long, group = "password", requires = "username")]
    password_file: Option<PathBuf>,

    /// Take registry credentials from a pipeline definition
    #[arg(short, long)]
    file: Option<PathBuf>,
}

impl ScanArgs {
    /// Credentials for `registry`, from the command line or a definition.
    fn credentials(&self, registry: &str) -> Result<Option<CredentialEntry>> {
        if let Some(username) = &self.username {
            let source = match (&self.password_env, &self.password_file) {
                (Some(var), _) => SecretSource::Env(var.clone()),
                (None, Some(path)) => SecretSource::File(path.clone()),
                (None, None) => bail!("--username needs --password-env or --password-file"),
            };
            return Ok(Some(CredentialEntry {
                address: shipyard_core::credential::normalize_address(registry),
                principal: username.clone(),
                secret: source.resolve(registry)?,
            }));
        }

        let Some(file) = &self.file else {
            return Ok(None);
        };
        let ctx = VariableContext::detect(&definition_dir(file).to_string_lossy());
        let def = load_pipeline(file, &ctx)
            .with_context(|| format!("Failed to load pipeline definition: {}", file.display()))?;
        let credentials = def
            .credentials()
            .context("Failed to resolve registry credentials")?;
        Ok(credentials.resolve(registry).cloned())
    }
}

pub async fn scan(work_dir: &Path, args: ScanArgs) -> Result<()> {
    let reference = ImageReference::parse(&args.image)?.or_default_tag();
    let target = ScanTarget::Registry {
        reference: reference.to_string(),
    };
    let gate = ScanGate::new(args.severity, Some(OutputFormat::new(args.format.clone())));
    let credentials = args.credentials(reference.registry())?;
    info!(
        image = %reference,
        authenticated = credentials.is_some(),
        "Scanning image"
    );

    let scanner = GrypeScanner::default().with_db_cache_dir(work_dir.join("grype-db"));
    let report = scanner
        .scan(&target, &gate.output_format, credentials.as_ref())
        .await
        .with_context(|| format!("Failed to scan {}", reference))?;

    if let Some(rendered) = report.rendered() {
        println!("{}", rendered);
    }

    let summary = report.summary();
    println!(
        "{} finding(s): {} critical, {} high, {} medium, {} low",
        summary.total, summary.critical, summary.high, summary.medium, summary.low
    );

    match gate.evaluate(&report) {
        GateDecision::Pass => {
            println!("✓ Scan gate passed");
            Ok(())
        }
        GateDecision::Fail(findings) => {
            for finding in &findings {
                println!("  {}", finding);
            }
            bail!(
                "Scan gate failed: {} finding(s) at or above {}",
                findings.len(),
                args.severity.map(|s| s.to_string()).unwrap_or_default()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> ScanArgs {
        #[derive(clap::Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ScanArgs,
        }
        let mut argv = vec!["shipyard", "ghcr.io/acme/private:v1"];
        argv.extend_from_slice(extra);
        <Wrapper as clap::Parser>::parse_from(argv).args
    }

    #[test]
    fn test_anonymous_by_default() {
        assert!(args(&[]).credentials("ghcr.io").unwrap().is_none());
    }

    #[test]
    fn test_credentials_from_password_file() {
        let dir = tempfile::tempdir().unwrap();
        let password = dir.path().join("token");
        std::fs::write(&password, "s3cret\n").unwrap();

        let entry = args(&["--username", "bot", "--password-file", password.to_str().unwrap()])
            .credentials("ghcr.io")
            .unwrap()
            .unwrap();
        assert_eq!(entry.address, "ghcr.io");
        assert_eq!(entry.principal, "bot");
        assert_eq!(entry.secret.expose(), "s3cret");
    }

    #[test]
    fn test_credentials_from_definition() {
        let dir = tempfile::tempdir().unwrap();
        let password = dir.path().join("token");
        std::fs::write(&password, "from-file").unwrap();
        let file = dir.path().join("shipyard.kdl");
        std::fs::write(
            &file,
            format!(
                r#"
pipeline "app"
apko "apko.yaml"
registry "ghcr.io" username="bot" password-file="{}"
"#,
                password.display()
            ),
        )
        .unwrap();

        let parsed = args(&["-f", file.to_str().unwrap()]);
        let entry = parsed.credentials("ghcr.io").unwrap().unwrap();
        assert_eq!(entry.principal, "bot");
        assert_eq!(entry.secret.expose(), "from-file");
        assert!(parsed.credentials("docker.io").unwrap().is_none());
    }

    #[test]
    fn test_username_requires_password_source() {
        #[derive(clap::Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: ScanArgs,
        }
        let result = <Wrapper as clap::Parser>::try_parse_from([
            "shipyard",
            "ghcr.io/acme/private:v1",
            "--username",
            "bot",
        ]);
        assert!(result.is_err());
    }
}
