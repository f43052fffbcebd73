pub mod run;
pub mod serve;
pub mod snapshots;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::job::JobRunner;
use crate::sandbox::Sandbox;
use crate::snapshot::SnapshotRegistry;

/// Wire the registry and the job sandbox from configuration.
///
/// The job account is resolved here, once, so a misconfigured `job.user`
/// fails at startup instead of on the first request.
fn job_runner(config: &Config) -> Result<JobRunner> {
    let registry = Arc::new(SnapshotRegistry::new(config.storage.data()));
    let sandbox = Sandbox::for_account(config.storage.workspace(), config.job.user())
        .context("Failed to resolve job.user")?;
    Ok(JobRunner::new(registry, sandbox, config.job.timeout()))
}
