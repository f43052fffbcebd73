use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::SnapshotVersion;
use crate::error::PoolError;

/// Ordered catalog of built snapshots, persisted as a JSON array next to the
/// images themselves.
///
/// The list is loaded lazily on first use and kept for the lifetime of the
/// process. Only the builder mutates it; the serving path only resolves.
#[derive(Debug)]
pub struct SnapshotRegistry {
    data_dir: PathBuf,
    /// `None` until the record has been read (or replaced by a build).
    versions: RwLock<Option<Vec<SnapshotVersion>>>,
}

impl SnapshotRegistry {
    pub const RECORD_FILE: &'static str = "maxima-versions.json";

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            versions: RwLock::new(None),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.data_dir.join(Self::RECORD_FILE)
    }

    /// Location of the executable image for `version`.
    pub fn artifact_path(&self, version: &SnapshotVersion) -> PathBuf {
        self.data_dir.join(version.artifact_name())
    }

    /// Read the persisted record, replacing the in-memory list.
    ///
    /// A missing record is an empty registry. On any other failure the list
    /// is left empty and the error is returned.
    pub fn load(&self) -> Result<(), PoolError> {
        let path = self.record_path();
        let loaded = match read_record(&path) {
            Ok(versions) => Ok(versions),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "registry:no record, starting empty");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "registry:load failed");
                Err(PoolError::Persistence(format!("registry record unreadable: {e}")))
            }
        };

        let mut guard = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        match loaded {
            Ok(versions) => {
                debug!(count = versions.len(), "registry:loaded");
                *guard = Some(versions);
                Ok(())
            }
            Err(e) => {
                *guard = Some(Vec::new());
                Err(e)
            }
        }
    }

    /// Persist the full list, atomically replacing the previous record.
    pub fn store(&self) -> Result<(), PoolError> {
        let versions = self.versions();
        let path = self.record_path();

        let write = || -> io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&self.data_dir)?;
            serde_json::to_writer_pretty(&mut tmp, &versions).map_err(io::Error::from)?;
            tmp.write_all(b"\n")?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| {
            warn!(path = %path.display(), error = %e, "registry:store failed");
            PoolError::Persistence(e.to_string())
        })?;

        info!(count = versions.len(), path = %path.display(), "registry:stored");
        Ok(())
    }

    /// Pick the snapshot to run for a request.
    ///
    /// An empty request selects the most recently built snapshot. A named
    /// version must be registered; unknown versions are an error rather than a
    /// silent fallback.
    pub fn resolve(&self, requested: &str) -> Result<SnapshotVersion, PoolError> {
        self.ensure_loaded();
        let guard = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        let versions = guard.as_deref().unwrap_or_default();

        let latest = versions.last().ok_or(PoolError::NoSnapshotsFound)?;
        if requested.is_empty() {
            return Ok(latest.clone());
        }

        versions
            .iter()
            .find(|v| v.as_str() == requested)
            .cloned()
            .ok_or_else(|| PoolError::VersionNotFound(requested.to_string()))
    }

    /// Copy of the registered versions in build order.
    pub fn versions(&self) -> Vec<SnapshotVersion> {
        self.ensure_loaded();
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Start a new build cycle with an empty list.
    pub(crate) fn reset(&self) {
        *self.versions.write().unwrap_or_else(PoisonError::into_inner) = Some(Vec::new());
    }

    /// Append `version` unless it is already registered. Returns whether it
    /// was added.
    pub(crate) fn append(&self, version: SnapshotVersion) -> bool {
        let mut guard = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let versions = guard.get_or_insert_with(Vec::new);
        if versions.contains(&version) {
            return false;
        }
        versions.push(version);
        true
    }

    fn ensure_loaded(&self) {
        let loaded = self
            .versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !loaded && let Err(e) = self.load() {
            warn!(error = %e, "registry:lazy load failed, treating as empty");
        }
    }
}

fn read_record(path: &Path) -> io::Result<Vec<SnapshotVersion>> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(io::Error::from)
}
