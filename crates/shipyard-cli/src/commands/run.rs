//! Build, scan and publish a pipeline definition.

use anyhow::{Context, Result, bail};
use clap::Args;
use shipyard_backend::{AnyBackend, BackendSettings};
use shipyard_config::{VariableContext, load_pipeline};
use shipyard_core::{Error, OutputFormat, ScanGate, Severity};
use shipyard_pipeline::{Pipeline, PipelineEvent};
use shipyard_scanner::GrypeScanner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::definition_dir;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the definition file
    #[arg(short, long, default_value = shipyard_config::DEFAULT_FILE)]
    file: PathBuf,

    /// Platforms to build (overrides the definition)
    #[arg(long = "platform")]
    platforms: Vec<String>,

    /// Publish reference (overrides the definition)
    #[arg(long)]
    tag: Option<String>,

    /// Extra tags for the published artifact (overrides the definition)
    #[arg(long = "alias")]
    aliases: Vec<String>,

    /// Fail publishing on findings at or above this severity
    #[arg(long)]
    severity: Option<Severity>,

    /// Scan report format
    #[arg(long)]
    format: Option<String>,

    /// Build only
    #[arg(long)]
    no_publish: bool,

    /// Set a custom variable, `name=value`
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

/// Scan gate from the command line, falling back to the definition.
fn scan_gate(args: &RunArgs, defined: Option<ScanGate>) -> Option<ScanGate> {
    let format = args.format.clone().map(OutputFormat::new);
    match (args.severity, defined) {
        (Some(severity), _) => Some(ScanGate::new(Some(severity), format)),
        (None, Some(mut gate)) => {
            if let Some(format) = format {
                gate.output_format = format;
            }
            Some(gate)
        }
        (None, None) => None,
    }
}

pub async fn run(work_dir: &Path, args: RunArgs) -> Result<()> {
    let mut ctx = VariableContext::detect(&definition_dir(&args.file).to_string_lossy());
    for (name, value) in &args.vars {
        ctx.set(name, value.as_str());
    }

    let def = load_pipeline(&args.file, &ctx)
        .with_context(|| format!("Failed to load pipeline definition: {}", args.file.display()))?;

    info!(
        file = %args.file.display(),
        backend = %def.backend.kind(),
        registries = def.registries.len(),
        "Loaded pipeline definition"
    );
    println!("Running pipeline: {}", def.name);

    let settings = BackendSettings::new(work_dir);
    let backend = AnyBackend::for_config(&def.backend, &settings)
        .with_context(|| format!("Failed to set up {} backend", def.backend.kind()))?;
    let scanner = GrypeScanner::default().with_db_cache_dir(work_dir.join("grype-db"));

    let mut pipeline = Pipeline::new(Arc::new(backend)).with_scanner(Arc::new(scanner));

    let credentials = def.credentials().context("Failed to resolve registry credentials")?;
    for entry in credentials.iter() {
        pipeline = pipeline.with_registry_auth(&entry.address, entry.principal.clone(), entry.secret.clone());
    }
    for address in def.anonymous_registries() {
        pipeline = pipeline.with_anonymous_registry(address);
    }

    let platforms = if args.platforms.is_empty() {
        &def.platforms
    } else {
        &args.platforms
    };
    debug!(platforms = ?platforms, max_parallel = ?def.max_parallel, "Configuring platforms");
    pipeline = pipeline.with_platforms(platforms)?;
    if let Some(n) = def.max_parallel {
        pipeline = pipeline.with_max_parallel(n);
    }

    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_events(rx));
    let pipeline = pipeline.with_events(tx);

    let outcome = execute(&pipeline, &def, &args).await;

    // The printer finishes once every pipeline value holding the sender is gone.
    drop(pipeline);
    let _ = printer.await;

    match outcome {
        Ok(Outcome::Built { reference, digest }) => {
            if args.json {
                println!("{}", serde_json::json!({ "reference": reference, "digest": digest }));
            } else {
                println!("\n✓ Built {} ({})", reference, digest);
            }
            Ok(())
        }
        Ok(Outcome::Published { published, report }) => {
            if let Some(report) = report {
                println!("\n{}", report);
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&published)?);
            } else {
                println!("\n✓ Published {}", published.address);
                println!("  reference: {}", published.reference);
                println!("  digest:    {}", published.digest);
                for alias in &published.aliases {
                    println!("  alias:     {}", alias);
                }
            }
            Ok(())
        }
        Err(Error::ScanGate { cutoff, findings }) => {
            println!("\n✗ Scan gate failed: {} finding(s) at or above {}", findings.len(), cutoff);
            for finding in &findings {
                println!("  {}", finding);
            }
            bail!("Publish blocked by scan gate");
        }
        Err(Error::AliasPush { published, failures }) => {
            println!("\n✓ Published {}", published.reference);
            for failure in &failures {
                println!("✗ Alias {} failed: {}", failure.target, failure.message);
            }
            bail!("{} alias(es) failed", failures.len());
        }
        Err(e) => {
            let stage = e.stage();
            Err(e).context(format!("Pipeline '{}' failed at {}", def.name, stage))
        }
    }
}

enum Outcome {
    Built {
        reference: String,
        digest: String,
    },
    Published {
        published: shipyard_core::PublishedRef,
        report: Option<String>,
    },
}

async fn execute(
    pipeline: &Pipeline,
    def: &shipyard_config::PipelineDefinition,
    args: &RunArgs,
) -> shipyard_core::Result<Outcome> {
    let built = pipeline.build(&def.backend, None).await?;

    if args.no_publish {
        let artifact = built
            .artifact()
            .ok_or_else(|| Error::Internal("build returned no artifact".to_string()))?;
        return Ok(Outcome::Built {
            reference: artifact.reference().to_string(),
            digest: artifact.digest().to_string(),
        });
    }

    let tag = match (&args.tag, &def.publish) {
        (Some(tag), _) => tag.clone(),
        (None, Some(publish)) => publish.tag.clone(),
        (None, None) => {
            return Err(Error::Config(
                "no publish target: pass --tag or add a publish node".to_string(),
            ));
        }
    };
    let aliases = if args.aliases.is_empty() {
        def.publish.as_ref().map(|p| p.aliases.clone()).unwrap_or_default()
    } else {
        args.aliases.clone()
    };

    let built = match scan_gate(args, def.scan.as_ref().map(|s| s.gate())) {
        Some(gate) => built.with_scan_gate(gate),
        None => built,
    };

    let published = built.publish(&tag, &aliases).await?;
    let report = published
        .scan_report()
        .and_then(|r| r.rendered())
        .map(str::to_string);

    let published = published
        .published()
        .cloned()
        .ok_or_else(|| Error::Internal("publish returned no reference".to_string()))?;

    Ok(Outcome::Published { published, report })
}

async fn print_events(mut rx: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::BuildStarted { platform, .. } => {
                println!("▶ Building {}", platform);
            }
            PipelineEvent::BuildCompleted { platform, digest, .. } => {
                println!("✓ Built {} ({})", platform, digest);
            }
            PipelineEvent::BuildFailed { platform, message, .. } => {
                println!("✗ Build for {} failed: {}", platform, message);
            }
            PipelineEvent::ArtifactAssembled { digest, platforms, .. } => {
                println!("✓ Assembled {} platform(s) as {}", platforms, digest);
            }
            PipelineEvent::ScanCompleted { summary, passed } => {
                println!(
                    "{} Scan: {} critical, {} high, {} medium, {} low, {} negligible, {} unknown",
                    if passed { "✓" } else { "✗" },
                    summary.critical,
                    summary.high,
                    summary.medium,
                    summary.low,
                    summary.negligible,
                    summary.unknown
                );
            }
            PipelineEvent::Pushed { address, digest } => {
                println!("✓ Pushed {} ({})", address, digest);
            }
            PipelineEvent::AliasPushed { address } => {
                println!("✓ Tagged {}", address);
            }
            PipelineEvent::AliasFailed { address, message } => {
                println!("✗ Tagging {} failed: {}", address, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        #[derive(clap::Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: RunArgs,
        }
        let mut argv = vec!["shipyard"];
        argv.extend_from_slice(extra);
        <Wrapper as clap::Parser>::parse_from(argv).args
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("release=1.2=3").unwrap(),
            ("release".to_string(), "1.2=3".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_cli_severity_overrides_definition() {
        let defined = ScanGate::new(Some(Severity::Critical), None).report_only();
        let gate = scan_gate(&args(&["--severity", "high"]), Some(defined)).unwrap();
        assert_eq!(gate.cutoff, Some(Severity::High));
        assert!(gate.enforce);
    }

    #[test]
    fn test_cli_format_applies_to_defined_gate() {
        let defined = ScanGate::new(Some(Severity::Critical), None);
        let gate = scan_gate(&args(&["--format", "json"]), Some(defined)).unwrap();
        assert_eq!(gate.cutoff, Some(Severity::Critical));
        assert_eq!(gate.output_format.as_str(), "json");

        assert!(scan_gate(&args(&[]), None).is_none());
    }
}
