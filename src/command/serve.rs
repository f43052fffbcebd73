use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::job::JobRunner;
use crate::server;
use crate::snapshot::SnapshotVersion;

pub fn run(config: &Config) -> Result<()> {
    let runner = super::job_runner(config)?;

    let latest = check_ready(&runner).with_context(|| {
        format!(
            "No usable snapshot in {}. Run 'maxima-pool snapshots build' first.",
            config.storage.data().display()
        )
    })?;
    info!(
        %latest,
        snapshots = runner.registry().versions().len(),
        user = ?config.job.user(),
        "serve:starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(server::serve(&config.server, runner.clone()));

    // Jobs still running past the grace period would otherwise keep their
    // process groups and workspaces after the runtime drops their threads.
    let aborted = runner.abort_running();
    if aborted > 0 {
        warn!(aborted, "serve:aborted jobs still running after grace period");
    }
    runtime.shutdown_timeout(config.server.shutdown_grace());
    result
}

/// The service only accepts traffic with at least one registered snapshot.
fn check_ready(runner: &JobRunner) -> Result<SnapshotVersion> {
    Ok(runner.registry().resolve("")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Sandbox;
    use crate::snapshot::SnapshotRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(data: &TempDir, work: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data = Some(data.path().to_path_buf());
        config.storage.workspace = Some(work.path().to_path_buf());
        // Would fail to bind if startup ever got that far.
        config.server.host = Some("256.0.0.1".to_string());
        config
    }

    #[test]
    fn empty_registry_is_not_ready() {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let runner = JobRunner::new(
            Arc::new(SnapshotRegistry::new(data.path())),
            Sandbox::new(work.path(), None),
            Duration::from_secs(1),
        );
        assert!(check_ready(&runner).is_err());
    }

    #[test]
    fn registered_snapshot_is_ready() {
        let data = TempDir::new().unwrap();
        std::fs::write(
            data.path().join(SnapshotRegistry::RECORD_FILE),
            r#"["2022010100","2023010100"]"#,
        )
        .unwrap();
        let work = TempDir::new().unwrap();
        let runner = JobRunner::new(
            Arc::new(SnapshotRegistry::new(data.path())),
            Sandbox::new(work.path(), None),
            Duration::from_secs(1),
        );
        assert_eq!(check_ready(&runner).unwrap().as_str(), "2023010100");
    }

    #[test]
    fn serve_refuses_to_start_without_snapshots() {
        let data = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let err = run(&config(&data, &work)).unwrap_err();
        assert!(format!("{err:#}").contains("No usable snapshot"), "{err:#}");
        assert!(format!("{err:#}").contains("no snapshots are found"), "{err:#}");
    }
}
