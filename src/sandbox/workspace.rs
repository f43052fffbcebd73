use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use super::ExecutionIdentity;

/// Scratch directory owned by exactly one sandboxed invocation.
///
/// `cleanup` removes the directory and may be called any number of times.
/// Dropping the handle cleans up as well, so early returns never leak a
/// workspace.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    /// Create an empty `maxima-XXXXXX` directory under `root`, owned by
    /// `identity` when one is given.
    pub fn create(root: &Path, identity: Option<&ExecutionIdentity>) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("maxima-")
            .tempdir_in(root)?;

        if let Some(identity) = identity {
            identity.chown(dir.path()).map_err(io::Error::from)?;
        }

        debug!(path = %dir.path().display(), "workspace:created");
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the workspace and everything in it.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                debug!(path = %self.path.display(), "workspace:cleanup");
                match dir.close() {
                    // Already removed by `Sandbox::abort_all`.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            }
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(path = %self.path.display(), error = %e, "workspace:cleanup failed");
        }
    }
}
