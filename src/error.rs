//! Error taxonomy shared by the job and snapshot paths.

use std::time::Duration;

use crate::sandbox::ExecError;

/// Failures surfaced to callers of the job orchestrator and the registry.
///
/// Messages are safe to show to clients: they never carry workspace paths,
/// account names or uids.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no snapshots are found in storage path")]
    NoSnapshotsFound,

    #[error("snapshot version not found: {0}")]
    VersionNotFound(String),

    #[error("execution time limit of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("snapshot registry could not be persisted: {0}")]
    Persistence(String),
}

impl PoolError {
    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::InvalidInput(_) => "invalid_input",
            PoolError::NoSnapshotsFound => "no_snapshots",
            PoolError::VersionNotFound(_) => "version_not_found",
            PoolError::Timeout(_) => "timeout",
            PoolError::ExecutionFailure(_) => "execution_failure",
            PoolError::Io(_) => "io_failure",
            PoolError::Persistence(_) => "persistence_failure",
        }
    }
}

impl From<ExecError> for PoolError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout(limit) => PoolError::Timeout(limit),
            ExecError::Spawn { .. } => {
                PoolError::ExecutionFailure("interpreter could not be started".to_string())
            }
            ExecError::Exit { code, signal, .. } => PoolError::ExecutionFailure(match (code, signal) {
                (Some(code), _) => format!("interpreter exited with status {code}"),
                (None, Some(signal)) => format!("interpreter terminated by signal {signal}"),
                (None, None) => "interpreter exited abnormally".to_string(),
            }),
            ExecError::Workspace(_) => PoolError::Io("workspace could not be prepared".to_string()),
            ExecError::Identity(_) => {
                PoolError::Io("execution identity could not be resolved".to_string())
            }
            ExecError::Stream(_) => PoolError::Io("interpreter streams failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_maps_to_execution_failure() {
        let err: PoolError = ExecError::Exit {
            code: Some(3),
            signal: None,
            stderr: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, PoolError::ExecutionFailure(ref msg) if msg.contains("status 3")));
        assert_eq!(err.code(), "execution_failure");
    }

    #[test]
    fn timeout_is_not_conflated_with_exit() {
        let err: PoolError = ExecError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(err.to_string(), "execution time limit of 1000ms exceeded");
    }

    #[test]
    fn workspace_error_hides_path() {
        let err: PoolError = ExecError::Workspace(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "/srv/secret/maxima-abc",
        ))
        .into();
        assert!(!err.to_string().contains("/srv/secret"));
    }
}
