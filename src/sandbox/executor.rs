use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};
use wait_timeout::ChildExt;

use super::{ExecutionIdentity, IdentityError, Workspace};

/// Minimum time granted to collect output once the process group is gone.
const DRAIN_FLOOR: Duration = Duration::from_millis(100);

/// Reasons a sandboxed invocation can fail. Each kind is reported distinctly;
/// in particular a deadline hit is never folded into an exit failure.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to create workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("failed to set up process streams: {0}")]
    Stream(#[source] io::Error),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("deadline of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("process exited unsuccessfully (code {code:?}, signal {signal:?})")]
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },
}

/// Output of a finished invocation together with the workspace it ran in.
///
/// The workspace stays on disk until `workspace.cleanup()` is called or the
/// value is dropped, so callers can collect generated files first.
#[derive(Debug)]
pub struct Execution {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub workspace: Workspace,
    _tracked: Tracked,
}

/// Workspaces of invocations in flight, with the process group still to be
/// killed if the invocation is abandoned.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashMap<PathBuf, Option<Pid>>>);

impl InFlight {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Option<Pid>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration of one invocation in `InFlight`, removed on drop.
#[derive(Debug)]
struct Tracked {
    in_flight: Arc<InFlight>,
    workspace: PathBuf,
}

impl Tracked {
    fn new(in_flight: &Arc<InFlight>, workspace: &Path) -> Self {
        in_flight.entries().insert(workspace.to_path_buf(), None);
        Self {
            in_flight: Arc::clone(in_flight),
            workspace: workspace.to_path_buf(),
        }
    }

    fn set_group(&self, group: Option<Pid>) {
        if let Some(entry) = self.in_flight.entries().get_mut(&self.workspace) {
            *entry = group;
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.in_flight.entries().remove(&self.workspace);
    }
}

/// Runs commands in throwaway workspaces under `workspace_root`.
///
/// Clones share the set of in-flight invocations, so `abort_all` on any clone
/// reaches every run started through the others.
#[derive(Debug, Clone)]
pub struct Sandbox {
    workspace_root: PathBuf,
    identity: Option<ExecutionIdentity>,
    in_flight: Arc<InFlight>,
}

impl Sandbox {
    pub fn new(workspace_root: impl Into<PathBuf>, identity: Option<ExecutionIdentity>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            identity,
            in_flight: Arc::default(),
        }
    }

    /// Build a sandbox whose processes run as the named account, or as the
    /// service itself when `account` is `None`.
    pub fn for_account(
        workspace_root: impl Into<PathBuf>,
        account: Option<&str>,
    ) -> Result<Self, ExecError> {
        let identity = ExecutionIdentity::resolve(account)?;
        Ok(Self::new(workspace_root, identity))
    }

    pub fn identity(&self) -> Option<&ExecutionIdentity> {
        self.identity.as_ref()
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Kill the process group of every invocation still in flight and remove
    /// its workspace. Used when the service gives up waiting on shutdown.
    /// Returns the number of invocations aborted.
    pub fn abort_all(&self) -> usize {
        let entries: Vec<(PathBuf, Option<Pid>)> = self
            .in_flight
            .entries()
            .iter()
            .map(|(path, group)| (path.clone(), *group))
            .collect();

        for (workspace, group) in &entries {
            if let Some(pgid) = group {
                kill_group(*pgid);
            }
            match fs::remove_dir_all(workspace) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %workspace.display(), error = %e, "sandbox:abort cleanup failed")
                }
            }
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "sandbox:aborted in-flight invocations");
        }
        entries.len()
    }

    /// Run `program` with `args` in a fresh workspace, feeding it `stdin`.
    ///
    /// The process is started in its own process group. Once the leader
    /// exits, the rest of the group is killed, so background processes never
    /// outlive the call. When `timeout` elapses (including while output is
    /// still held open by a process outside the group) the call fails with
    /// `Timeout` and whatever output was buffered is thrown away. On every
    /// error path the workspace is removed before returning.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        timeout: Duration,
        stdin: &[u8],
        program: impl AsRef<OsStr>,
        args: &[S],
    ) -> Result<Execution, ExecError> {
        let program = program.as_ref();
        let program_display = program.to_string_lossy().into_owned();

        let workspace = Workspace::create(&self.workspace_root, self.identity.as_ref())
            .map_err(ExecError::Workspace)?;
        let tracked = Tracked::new(&self.in_flight, workspace.path());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(identity) = &self.identity {
            cmd.uid(identity.uid()).gid(identity.gid());
        }

        trace!(program = %program_display, timeout_ms = timeout.as_millis() as u64, "sandbox:spawn");
        let started = Instant::now();
        let deadline = started + timeout;
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program_display.clone(),
            source,
        })?;
        let pgid = Pid::from_raw(child.id() as i32);
        tracked.set_group(Some(pgid));

        let (Some(child_stdin), Some(child_stdout), Some(child_stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            terminate(&mut child);
            tracked.set_group(None);
            return Err(ExecError::Stream(io::Error::other(
                "child process streams were not captured",
            )));
        };

        let stdout_reader = spawn_reader(child_stdout);
        let stderr_reader = spawn_reader(child_stderr);
        let stdin_writer = spawn_writer(child_stdin, stdin.to_vec());

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                terminate(&mut child);
                tracked.set_group(None);
                debug!(
                    program = %program_display,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sandbox:timeout"
                );
                return Err(ExecError::Timeout(timeout));
            }
            Err(e) => {
                terminate(&mut child);
                tracked.set_group(None);
                return Err(ExecError::Stream(e));
            }
        };
        // The leader is gone; take whatever it left running with it.
        kill_group(pgid);
        tracked.set_group(None);

        let collected = collect(stdin_writer, deadline, timeout).and_then(|()| {
            Ok((
                collect(stdout_reader, deadline, timeout)?,
                collect(stderr_reader, deadline, timeout)?,
            ))
        });
        let (stdout, stderr) = collected.inspect_err(|e| {
            if matches!(e, ExecError::Timeout(_)) {
                debug!(program = %program_display, "sandbox:output held open past deadline");
            }
        })?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).into_owned();
            debug!(
                program = %program_display,
                code = ?status.code(),
                signal = ?status.signal(),
                stderr = %stderr.trim(),
                "sandbox:exit failure"
            );
            return Err(ExecError::Exit {
                code: status.code(),
                signal: status.signal(),
                stderr,
            });
        }

        trace!(
            program = %program_display,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stdout_len = stdout.len(),
            "sandbox:success"
        );
        Ok(Execution {
            stdout,
            stderr,
            workspace,
            _tracked: tracked,
        })
    }
}

/// SIGKILL every remaining member of `pgid`; an already empty group is fine.
fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(error = %e, "sandbox:killpg failed"),
    }
}

/// Kill the child's process group (falling back to the child alone) and reap it.
fn terminate(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        warn!(error = %e, "sandbox:killpg failed, killing child only");
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn spawn_reader<R>(mut pipe: R) -> Receiver<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = tx.send(pipe.read_to_end(&mut buf).map(|_| buf));
    });
    rx
}

fn spawn_writer(mut pipe: ChildStdin, input: Vec<u8>) -> Receiver<io::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let written = match pipe.write_all(&input) {
            // The process may exit without consuming its input.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        };
        // Close the child's stdin before reporting.
        drop(pipe);
        let _ = tx.send(written);
    });
    rx
}

/// Wait for a pipe thread until `deadline`. A thread still blocked then means
/// something outside the process group holds the pipe open.
fn collect<T>(
    rx: Receiver<io::Result<T>>,
    deadline: Instant,
    timeout: Duration,
) -> Result<T, ExecError> {
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(DRAIN_FLOOR);
    match rx.recv_timeout(wait) {
        Ok(result) => result.map_err(ExecError::Stream),
        Err(RecvTimeoutError::Timeout) => Err(ExecError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(ExecError::Stream(io::Error::other(
            "pipe thread exited without a result",
        ))),
    }
}
