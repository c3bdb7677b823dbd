//! Shipyard CLI: build, scan and publish container artifacts.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Build, scan and publish apko, melange, Docker and Helm artifacts", long_about = None)]
struct Cli {
    /// Directory for build outputs
    #[arg(long, global = true, env = "SHIPYARD_WORK_DIR", default_value = ".shipyard")]
    work_dir: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, scan and publish a pipeline definition
    Run(commands::run::RunArgs),
    /// Validate a pipeline definition
    Validate {
        /// Path to the definition file
        #[arg(short, long, default_value = shipyard_config::DEFAULT_FILE)]
        file: PathBuf,
    },
    /// Scan a registry image and apply a severity gate
    Scan(commands::scan::ScanArgs),
    /// Print the normalized platform set for the given specs
    Platforms {
        /// Platform specs, e.g. `linux/amd64,linux/arm64`
        #[arg(required = true)]
        specs: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Run(args) => {
            commands::run::run(&cli.work_dir, args).await?;
        }
        Commands::Validate { file } => {
            commands::validate(&file)?;
        }
        Commands::Scan(args) => {
            commands::scan::scan(&cli.work_dir, args).await?;
        }
        Commands::Platforms { specs } => {
            commands::platforms(&specs)?;
        }
    }

    Ok(())
}
