//! CLI command implementations.

pub mod run;
pub mod scan;

use anyhow::{Context, Result};
use shipyard_config::{RegistryAuth, VariableContext, load_pipeline};
use shipyard_core::{Platform, PlatformSet};
use std::path::Path;

/// Directory holding the definition, for git and relative paths.
pub(crate) fn definition_dir(file: &Path) -> &Path {
    file.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

pub fn validate(file: &Path) -> Result<()> {
    let ctx = VariableContext::detect(&definition_dir(file).to_string_lossy());
    let def = load_pipeline(file, &ctx)
        .with_context(|| format!("Invalid pipeline definition: {}", file.display()))?;
    let platforms = def.platform_set()?;

    println!("Pipeline '{}' is valid", def.name);
    println!("  backend:   {} ({})", def.backend.kind(), def.backend.name());
    println!("  platforms: {}", platforms);
    for registry in &def.registries {
        match &registry.auth {
            RegistryAuth::Anonymous => println!("  registry:  {} (anonymous)", registry.address),
            RegistryAuth::Credentials { username, password } => println!(
                "  registry:  {} as {} ({})",
                registry.address,
                username,
                password.describe()
            ),
        }
    }
    if let Some(scan) = &def.scan {
        let cutoff = scan.severity.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string());
        println!(
            "  scan:      fail on {}{}",
            cutoff,
            if scan.enforce { "" } else { " (report only)" }
        );
    }
    match &def.publish {
        Some(publish) => {
            println!("  publish:   {}", publish.tag);
            for alias in &publish.aliases {
                println!("  alias:     {}", alias);
            }
        }
        None => println!("  publish:   (none)"),
    }
    Ok(())
}

pub fn platforms(specs: &[String]) -> Result<()> {
    let set = PlatformSet::normalize(specs, &Platform::host())?;
    for platform in set.iter() {
        println!("{}", platform);
    }
    Ok(())
}
