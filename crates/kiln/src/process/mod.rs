//! Host process supervision
//!
//! Spawns untrusted programs in their own process group, supervises them
//! with a [`ProcessMonitor`] and terminates the whole group on violation.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub use crate::process::monitor::{MonitorHandle, MonitorReport, ProcessMonitor, Violation, WatchSpec};
pub use crate::process::output::{BatchOutput, run_batch};

mod monitor;
mod output;
pub(crate) mod procfs;

/// Errors that occur while spawning or driving a child process
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command '{0}' not found in PATH")]
    NotFound(String),

    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process has no pid (already reaped)")]
    NoPid,

    #[error("process group {0} already has a monitor")]
    AlreadyMonitored(i32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A program invocation, independent of how it is later spawned
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Build a tokio command with piped stdio, leading its own process group.
    ///
    /// The child is killed if its handle is dropped, and the group id equals
    /// the child's pid so [`ProcessGroup`] can signal every descendant.
    pub fn to_command(&self) -> Result<Command, ProcessError> {
        let program = resolve_program(&self.program)?;
        let mut command = Command::new(program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }

    /// Spawn the command
    pub fn spawn(&self) -> Result<tokio::process::Child, ProcessError> {
        let mut command = self.to_command()?;
        command.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => ProcessError::NotFound(self.program.clone()),
            _ => ProcessError::SpawnFailed {
                program: self.program.clone(),
                source,
            },
        })
    }
}

/// Resolve a bare program name through the host's PATH.
///
/// Names containing a `/` are returned unchanged.
pub fn resolve_program(program: &str) -> Result<PathBuf, ProcessError> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(program);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(ProcessError::NotFound(program.to_owned()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Termination authority over one process group.
///
/// Shared between the monitor and the owner of the child handle; whichever
/// calls [`terminate`](Self::terminate) first performs the kill and every
/// later call is a no-op.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pid,
    terminated: AtomicBool,
    monitored: AtomicBool,
}

impl ProcessGroup {
    /// Wrap the group led by `pid` (the child must have been spawned with
    /// [`CommandSpec::spawn`], which makes it a group leader)
    pub fn new(pid: u32) -> Self {
        Self {
            pgid: Pid::from_raw(pid as i32),
            terminated: AtomicBool::new(false),
            monitored: AtomicBool::new(false),
        }
    }

    /// Wrap the group of a freshly spawned child
    pub fn of(child: &tokio::process::Child) -> Result<Self, ProcessError> {
        child.id().map(Self::new).ok_or(ProcessError::NoPid)
    }

    pub fn id(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Whether any live (non-zombie) member of the group remains
    pub fn has_members(&self) -> bool {
        if matches!(killpg(self.pgid, None), Err(Errno::ESRCH)) {
            return false;
        }
        match procfs::group_usage(self.id()) {
            Ok(usage) => usage.members > 0,
            Err(_) => true,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Mark the group as supervised; `false` if a monitor is already attached
    pub(crate) fn claim_monitor(&self) -> bool {
        self.monitored
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Send SIGTERM to the group, wait up to `grace`, then SIGKILL.
    ///
    /// Returns `true` if this call performed the termination.
    pub async fn terminate(&self, grace: Duration) -> bool {
        if self
            .terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if !self.signal(Signal::SIGTERM) {
            return true;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.has_members() {
                debug!(pgid = self.id(), "process group exited after SIGTERM");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if self.signal(Signal::SIGKILL) {
            debug!(pgid = self.id(), "process group killed after grace period");
        }
        true
    }

    /// Signal the group; `false` once the group no longer exists
    fn signal(&self, signal: Signal) -> bool {
        match killpg(self.pgid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pgid = self.id(), %signal, error = %e, "failed to signal process group");
                false
            }
        }
    }
}
