//! Interactive sessions
//!
//! A session is a compiled program left running with open pipes. A
//! background task per session drains its stdout and stderr into line
//! buffers; callers send input and poll output by session id and never
//! block on the program itself.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub use crate::session::live::{SessionOutput, SessionState};

mod buffer;
mod live;
mod registry;

use crate::config::{Config, SessionConfig};
use crate::process::{CommandSpec, ProcessError, ProcessGroup, ProcessMonitor, WatchSpec};
use crate::runner::ErrorKind;
use crate::session::live::{Session, pump_output};
use crate::session::registry::SessionRegistry;
use crate::workspace::Workspace;

/// Errors from session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("process of session {0} is not running")]
    ProcessNotRunning(Uuid),

    #[error("session I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidSession(_) => ErrorKind::InvalidSession,
            SessionError::ProcessNotRunning(_) => ErrorKind::ProcessNotRunning,
            SessionError::Process(ProcessError::NotFound(_)) => ErrorKind::ToolchainUnavailable,
            SessionError::Io(_) | SessionError::Process(_) => ErrorKind::Internal,
        }
    }

    fn unknown(id: Uuid) -> Self {
        SessionError::InvalidSession(id.to_string())
    }
}

/// Owns every live session
#[derive(Debug)]
pub struct SessionManager {
    registry: SessionRegistry,
    config: SessionConfig,
    kill_grace: Duration,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: SessionRegistry::default(),
            config: config.sessions.clone(),
            kill_grace: config.monitor.kill_grace(),
        }
    }

    /// Launch `command` under a process monitor and register it.
    ///
    /// The session takes ownership of `workspace` and removes it on end.
    #[instrument(skip_all, fields(program = %command.program))]
    pub(crate) fn start(
        &self,
        command: CommandSpec,
        workspace: Workspace,
        spec: WatchSpec,
    ) -> Result<Uuid, SessionError> {
        let mut child = command.spawn()?;
        let group = Arc::new(ProcessGroup::of(&child)?);
        let monitor = ProcessMonitor::watch(group.clone(), spec)?;

        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SessionError::Io(io::Error::other("child output was not piped")));
        };

        let id = Uuid::new_v4();
        let session = Arc::new(Session::new(
            id,
            group.clone(),
            stdin,
            monitor,
            workspace,
            self.config.max_buffered_lines,
        ));
        let pump = tokio::spawn(pump_output(
            session.clone(),
            child,
            stdout,
            stderr,
            self.config.read_timeout(),
        ));
        session.attach_pump(pump);
        self.registry.insert(session);

        info!(session_id = %id, pgid = group.id(), "session started");
        Ok(id)
    }

    /// Send one line of input
    pub async fn send(&self, id: Uuid, text: &str) -> Result<(), SessionError> {
        let session = self.registry.get(&id).ok_or_else(|| SessionError::unknown(id))?;
        session.write_line(text).await
    }

    /// Signal end of input to the program
    pub async fn close_input(&self, id: Uuid) -> Result<(), SessionError> {
        let session = self.registry.get(&id).ok_or_else(|| SessionError::unknown(id))?;
        session.close_stdin().await;
        Ok(())
    }

    /// Return and clear buffered output.
    ///
    /// Once the program has exited, the final drain also ends the session.
    pub async fn drain(&self, id: Uuid) -> Result<SessionOutput, SessionError> {
        let session = self.registry.get(&id).ok_or_else(|| SessionError::unknown(id))?;
        let output = session.drain();
        if output.session_ended {
            debug!(session_id = %id, "program exited, ending session after final drain");
            self.end(id).await;
        }
        Ok(output)
    }

    /// Terminate and clean up a session. Returns `false` if it was already
    /// gone.
    pub async fn end(&self, id: Uuid) -> bool {
        let Some(session) = self.registry.remove(&id) else {
            return false;
        };
        session.close(self.kill_grace).await
    }

    pub fn state(&self, id: Uuid) -> Option<SessionState> {
        self.registry.get(&id).map(|session| session.state())
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.registry.ids()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End every session idle for longer than `threshold`
    pub async fn reap_idle(&self, threshold: Duration) -> Vec<Uuid> {
        let idle = self.registry.idle(threshold);
        for id in &idle {
            self.end(*id).await;
        }
        idle
    }

    /// Periodically reap idle sessions for as long as the manager lives
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.reap_interval();
        let idle_timeout = self.config.idle_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reaped = manager.reap_idle(idle_timeout).await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped idle sessions");
                }
            }
        })
    }

    /// End every session
    pub async fn shutdown(&self) -> usize {
        let mut ended = 0;
        for id in self.registry.ids() {
            if self.end(id).await {
                ended += 1;
            }
        }
        ended
    }
}
