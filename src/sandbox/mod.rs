//! Sandboxed execution of interpreter processes.
//!
//! Every invocation gets a fresh scratch workspace, an optional unprivileged
//! identity and a hard deadline. The workspace is removed when the returned
//! handle is cleaned up or dropped.

mod executor;
mod identity;
mod workspace;

pub use executor::{ExecError, Execution, Sandbox};
pub use identity::{ExecutionIdentity, IdentityError};
pub use workspace::Workspace;
