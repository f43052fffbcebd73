use std::path::Path;

use nix::unistd::{Gid, Uid, User, chown};
use tracing::debug;

/// A uid/gid pair that sandboxed processes run as.
///
/// Resolved once from an account name and then passed around by value, so the
/// executor never touches the account database on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionIdentity {
    uid: u32,
    gid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("execution account name is empty")]
    EmptyName,

    #[error("execution account '{0}' does not exist")]
    UnknownAccount(String),

    #[error("lookup of execution account '{name}' failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: nix::Error,
    },
}

impl ExecutionIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Look up an account by name in the host's account database.
    pub fn lookup(name: &str) -> Result<Self, IdentityError> {
        if name.trim().is_empty() {
            return Err(IdentityError::EmptyName);
        }

        let user = User::from_name(name)
            .map_err(|source| IdentityError::Lookup {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| IdentityError::UnknownAccount(name.to_string()))?;

        let identity = Self::new(user.uid.as_raw(), user.gid.as_raw());
        debug!(account = name, uid = identity.uid, gid = identity.gid, "identity:resolved");
        Ok(identity)
    }

    /// Resolve an optional account name; `None` means "keep the service identity".
    pub fn resolve(name: Option<&str>) -> Result<Option<Self>, IdentityError> {
        name.map(Self::lookup).transpose()
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Hand ownership of `path` to this identity.
    pub(crate) fn chown(&self, path: &Path) -> nix::Result<()> {
        chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
    }
}
