//! One live interactive process and the task draining its output

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::heuristics::looks_like_prompt;
use crate::process::{MonitorHandle, ProcessGroup};
use crate::session::SessionError;
use crate::session::buffer::OutputBuffer;
use crate::workspace::Workspace;

/// Lifecycle of an interactive session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process launched, output task not yet reading
    Starting,
    Running,
    /// Last output looked like a prompt, or the live process went quiet
    WaitingForInput,
    Producing,
    Ended,
}

/// Output drained from a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionOutput {
    pub stdout: String,
    pub stderr: String,
    pub waiting_for_input: bool,
    pub session_ended: bool,
    /// Older lines were dropped from a full buffer since the last drain
    pub truncated: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct Shared {
    state: SessionState,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    waiting_for_input: bool,
    exited: bool,
    exit_code: Option<i32>,
    last_activity: Instant,
}

#[derive(Debug)]
pub(crate) struct Session {
    id: Uuid,
    group: Arc<ProcessGroup>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    shared: Mutex<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<MonitorHandle>>,
    workspace: Mutex<Workspace>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        id: Uuid,
        group: Arc<ProcessGroup>,
        stdin: Option<ChildStdin>,
        monitor: MonitorHandle,
        workspace: Workspace,
        max_buffered_lines: usize,
    ) -> Self {
        Self {
            id,
            group,
            stdin: tokio::sync::Mutex::new(stdin),
            shared: Mutex::new(Shared {
                state: SessionState::Starting,
                stdout: OutputBuffer::new(max_buffered_lines),
                stderr: OutputBuffer::new(max_buffered_lines),
                waiting_for_input: false,
                exited: false,
                exit_code: None,
                last_activity: Instant::now(),
            }),
            pump: Mutex::new(None),
            monitor: Mutex::new(Some(monitor)),
            workspace: Mutex::new(workspace),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared().state
    }

    pub fn has_exited(&self) -> bool {
        self.shared().exited
    }

    /// Time since the caller last sent input or drained output
    pub fn idle_for(&self) -> Duration {
        self.shared().last_activity.elapsed()
    }

    pub fn attach_pump(&self, handle: JoinHandle<()>) {
        *lock(&self.pump) = Some(handle);
    }

    /// Write `text` and a newline to the program's stdin
    pub async fn write_line(&self, text: &str) -> Result<(), SessionError> {
        if self.has_exited() || self.closed.load(Ordering::Acquire) {
            return Err(SessionError::ProcessNotRunning(self.id));
        }

        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(SessionError::ProcessNotRunning(self.id));
        };

        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        let written = async {
            pipe.write_all(&line).await?;
            pipe.flush().await
        }
        .await;

        match written {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                *stdin = None;
                return Err(SessionError::ProcessNotRunning(self.id));
            }
            Err(e) => return Err(SessionError::Io(e)),
        }
        drop(stdin);

        let mut shared = self.shared();
        shared.waiting_for_input = false;
        if !shared.exited {
            shared.state = SessionState::Running;
        }
        shared.last_activity = Instant::now();
        debug!(session_id = %self.id, len = line.len(), "wrote to stdin");
        Ok(())
    }

    /// Close stdin so the program sees end of input
    pub async fn close_stdin(&self) {
        if self.stdin.lock().await.take().is_some() {
            debug!(session_id = %self.id, "closed stdin");
        }
    }

    /// Take everything buffered so far
    pub fn drain(&self) -> SessionOutput {
        let mut shared = self.shared();
        shared.last_activity = Instant::now();
        let (stdout, stdout_truncated) = shared.stdout.take();
        let (stderr, stderr_truncated) = shared.stderr.take();
        SessionOutput {
            stdout,
            stderr,
            waiting_for_input: shared.waiting_for_input && !shared.exited,
            session_ended: shared.exited,
            truncated: stdout_truncated || stderr_truncated,
            exit_code: shared.exit_code,
        }
    }

    /// Tear the session down. Only the first call does anything; returns
    /// whether this call performed the cleanup.
    pub async fn close(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.stdin.lock().await.take();
        if !self.has_exited() || self.group.has_members() {
            self.group.terminate(grace).await;
        }

        let pump = lock(&self.pump).take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(grace, &mut pump).await.is_err() {
                warn!(session_id = %self.id, "output task did not stop, aborting");
                pump.abort();
            }
        }

        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.finish().await;
        }

        lock(&self.workspace).remove();

        let mut shared = self.shared();
        shared.state = SessionState::Ended;
        shared.exited = true;
        info!(session_id = %self.id, exit_code = ?shared.exit_code, "session ended");
        true
    }

    fn set_running(&self) {
        let mut shared = self.shared();
        if shared.state == SessionState::Starting {
            shared.state = SessionState::Running;
        }
    }

    fn append(&self, stream: Stream, bytes: &[u8]) {
        let mut shared = self.shared();
        let buffer = match stream {
            Stream::Stdout => &mut shared.stdout,
            Stream::Stderr => &mut shared.stderr,
        };
        buffer.push(bytes);
        let prompt = buffer.last_line().is_some_and(looks_like_prompt);
        shared.waiting_for_input = prompt;
        shared.state = if prompt {
            SessionState::WaitingForInput
        } else {
            SessionState::Producing
        };
    }

    /// A read timed out while the process was alive
    fn mark_silent(&self) {
        let mut shared = self.shared();
        if !shared.exited && shared.state != SessionState::Ended {
            shared.waiting_for_input = true;
            shared.state = SessionState::WaitingForInput;
        }
    }

    fn mark_exited(&self, exit_code: Option<i32>) {
        let mut shared = self.shared();
        shared.stdout.finish();
        shared.stderr.finish();
        shared.exited = true;
        shared.exit_code = exit_code;
        shared.waiting_for_input = false;
        shared.state = SessionState::Ended;
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drain the program's stdout and stderr into the session buffers until both
/// close, then reap the child.
///
/// Every read is bounded by `read_timeout`; a timeout while the child is
/// still alive is taken as the program blocking on input.
pub(crate) async fn pump_output(
    session: Arc<Session>,
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    read_timeout: Duration,
) {
    let mut out_buf = vec![0u8; 4096];
    let mut err_buf = vec![0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;
    session.set_running();

    while out_open || err_open {
        let read = tokio::time::timeout(read_timeout, async {
            tokio::select! {
                result = stdout.read(&mut out_buf), if out_open => (Stream::Stdout, result),
                result = stderr.read(&mut err_buf), if err_open => (Stream::Stderr, result),
            }
        })
        .await;

        match read {
            Ok((stream, Ok(n))) if n > 0 => {
                let data = match stream {
                    Stream::Stdout => &out_buf[..n],
                    Stream::Stderr => &err_buf[..n],
                };
                session.append(stream, data);
            }
            Ok((stream, result)) => {
                if let Err(e) = result {
                    debug!(session_id = %session.id(), ?stream, error = %e, "output read failed");
                }
                match stream {
                    Stream::Stdout => out_open = false,
                    Stream::Stderr => err_open = false,
                }
            }
            Err(_) => match child.try_wait() {
                Ok(None) => session.mark_silent(),
                // The leader is gone but a descendant still holds the pipes
                Ok(Some(_)) | Err(_) => break,
            },
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(session_id = %session.id(), error = %e, "failed to reap session process");
            None
        }
    };
    debug!(session_id = %session.id(), ?exit_code, "session process exited");
    session.mark_exited(exit_code);
}
