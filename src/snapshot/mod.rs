//! Prebuilt Maxima snapshots: identifiers, the persisted registry, and the
//! pipeline that builds them from tagged STACK releases.

mod builder;
mod registry;

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use builder::{BuildReport, BuildSettings, SkipReason, SnapshotBuilder, TagFailure, TagSkip};
pub use registry::SnapshotRegistry;

/// File name prefix of every snapshot image in the artifact directory.
pub const ARTIFACT_PREFIX: &str = "maxima-";

/// Marker line in `stackmaxima.mac` naming the STACK Maxima library version.
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"stackmaximaversion:([0-9]{10})\$").unwrap());

/// Identifier of one built snapshot, e.g. `2023121100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(String);

impl SnapshotVersion {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Extract the version from the contents of `stackmaxima.mac`.
    pub fn from_marker(source: &str) -> Option<Self> {
        MARKER_RE
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|m| Self(m.as_str().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the executable image for this version.
    pub fn artifact_name(&self) -> String {
        format!("{ARTIFACT_PREFIX}{}", self.0)
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
