use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::Config;
use crate::sandbox::Sandbox;
use crate::snapshot::{SkipReason, SnapshotBuilder, SnapshotRegistry};

pub fn build(config: &Config) -> Result<()> {
    let mut settings = config.build_settings();
    let command = which::which(&settings.command)
        .with_context(|| format!("Maxima executable '{}' not found", settings.command))?;
    settings.command = command.to_string_lossy().into_owned();

    let data = config.storage.data();
    fs::create_dir_all(&data)
        .with_context(|| format!("Failed to create data directory at {}", data.display()))?;

    let registry = Arc::new(SnapshotRegistry::new(data));
    // Builds are trusted and must be able to write into storage.data, so they
    // keep the service's own identity.
    let sandbox = Sandbox::new(config.storage.workspace(), None);
    let report = SnapshotBuilder::new(registry, sandbox, settings).build()?;

    for skip in &report.skipped {
        match &skip.reason {
            SkipReason::NotAVersion => info!(tag = %skip.tag, "snapshots:skipped, not a version tag"),
            SkipReason::MarkerNotFound => warn!(tag = %skip.tag, "snapshots:skipped, no version marker"),
            SkipReason::DuplicateVersion(version) => {
                info!(tag = %skip.tag, %version, "snapshots:skipped, version already built")
            }
        }
    }
    for failure in &report.failed {
        eprintln!("Failed to build {}: {:#}", failure.tag, failure.error);
    }

    println!(
        "Built {} snapshot(s), skipped {} tag(s), {} failure(s).",
        report.built.len(),
        report.skipped.len(),
        report.failed.len()
    );
    if report.built.is_empty() {
        bail!("No snapshot was built");
    }
    Ok(())
}

pub fn list(config: &Config) -> Result<()> {
    let registry = SnapshotRegistry::new(config.storage.data());
    registry
        .load()
        .context("Failed to read the snapshot registry")?;

    let versions = registry.versions();
    if versions.is_empty() {
        println!("No snapshots in {}", config.storage.data().display());
        return Ok(());
    }
    let latest = versions.len() - 1;
    for (i, version) in versions.iter().enumerate() {
        if i == latest {
            println!("{version} (latest)");
        } else {
            println!("{version}");
        }
    }
    Ok(())
}
