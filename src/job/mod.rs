//! Job orchestration: resolve a snapshot, run the script in the sandbox and
//! package what it produced.

mod package;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::PoolError;
use crate::sandbox::Sandbox;
use crate::snapshot::SnapshotRegistry;

/// Placeholder STACK substitutes with the real plot URL after the fact.
pub const DEFAULT_PLOT_URL: &str = "!ploturl!";

/// One script execution as requested by a client.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    /// Maxima source to evaluate.
    pub input: String,
    /// Requested time limit; zero or anything above the ceiling uses the ceiling.
    pub timeout: Option<Duration>,
    pub plot_url_base: Option<String>,
    /// Snapshot to run against; empty selects the newest one.
    pub version: Option<String>,
}

/// Result payload of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    /// Raw interpreter stdout; no files were generated.
    Text(Vec<u8>),
    /// Zip archive: `OUTPUT` (raw stdout) followed by every generated file.
    Archive(Vec<u8>),
}

impl JobOutput {
    pub fn is_archive(&self) -> bool {
        matches!(self, JobOutput::Archive(_))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            JobOutput::Text(bytes) | JobOutput::Archive(bytes) => bytes,
        }
    }
}

/// Runs client scripts against registered snapshots.
#[derive(Debug, Clone)]
pub struct JobRunner {
    registry: Arc<SnapshotRegistry>,
    sandbox: Sandbox,
    timeout_ceiling: Duration,
}

impl JobRunner {
    pub fn new(registry: Arc<SnapshotRegistry>, sandbox: Sandbox, timeout_ceiling: Duration) -> Self {
        Self {
            registry,
            sandbox,
            timeout_ceiling,
        }
    }

    pub fn registry(&self) -> &SnapshotRegistry {
        &self.registry
    }

    /// Kill every job still running and remove its workspace.
    pub fn abort_running(&self) -> usize {
        self.sandbox.abort_all()
    }

    pub fn create_job(&self, request: &JobRequest) -> Result<JobOutput, PoolError> {
        validate(request)?;

        let version = self
            .registry
            .resolve(request.version.as_deref().unwrap_or_default())?;
        let artifact = self.registry.artifact_path(&version);
        let timeout = effective_timeout(self.timeout_ceiling, request.timeout);
        let script = compose_script(
            request.plot_url_base.as_deref().unwrap_or(DEFAULT_PLOT_URL),
            &request.input,
        );

        info!(%version, timeout_ms = timeout.as_millis() as u64, "job:start");
        let started = Instant::now();
        let mut execution = self
            .sandbox
            .run(timeout, script.as_bytes(), &artifact, &["--quiet"])
            .inspect_err(|e| warn!(%version, error = %e, "job:execution failed"))?;

        let stdout = std::mem::take(&mut execution.stdout);
        let packaged = package::package(execution.workspace.path(), stdout);
        if let Err(e) = execution.workspace.cleanup() {
            warn!(error = %e, "job:workspace cleanup failed");
        }

        let output = packaged.map_err(|e| {
            warn!(error = format!("{e:#}"), "job:packaging failed");
            PoolError::Io("job output could not be packaged".to_string())
        })?;
        info!(
            %version,
            archive = output.is_archive(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job:finished"
        );
        Ok(output)
    }
}

fn validate(request: &JobRequest) -> Result<(), PoolError> {
    if request.input.trim().is_empty() {
        return Err(PoolError::InvalidInput("input must not be empty".to_string()));
    }
    if let Some(version) = request.version.as_deref()
        && !version.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(PoolError::InvalidInput(format!(
            "malformed snapshot version '{version}'"
        )));
    }
    Ok(())
}

/// The requested limit unless it is zero or above the ceiling.
fn effective_timeout(ceiling: Duration, requested: Option<Duration>) -> Duration {
    match requested {
        Some(requested) if !requested.is_zero() && requested <= ceiling => requested,
        _ => ceiling,
    }
}

/// Prefix the user script with the bindings STACK expects: temp and plot
/// directories point at the process's working directory (its workspace).
fn compose_script(plot_url_base: &str, input: &str) -> String {
    let url: String = plot_url_base
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!(
        "maxima_tempdir:getcurrentdirectory()$ IMAGE_DIR:getcurrentdirectory()$ URL_BASE:\"{url}\"$\n{input}"
    )
}
