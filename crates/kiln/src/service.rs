//! Boundary operations for a web or UI layer
//!
//! Every call answers with a serializable response carrying
//! `success`, a human-readable `error` and its `error_kind`. Nothing here
//! returns `Err` or panics on bad input.

use std::fmt;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::config::{Config, Language};
use crate::runner::{ErrorKind, InitError, RunError, Runner};
use crate::scheduler::SchedulerStats;
use crate::session::SessionError;
use crate::types::{CompilationRequest, Metrics, ResourceLimits};

/// Failure half of every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub error: String,
    pub error_kind: ErrorKind,
}

impl Failure {
    fn new(kind: ErrorKind, error: impl fmt::Display) -> Self {
        Self {
            error: error.to_string(),
            error_kind: kind,
        }
    }
}

impl From<&RunError> for Failure {
    fn from(error: &RunError) -> Self {
        Failure::new(error.kind(), error)
    }
}

impl From<SessionError> for Failure {
    fn from(error: SessionError) -> Self {
        Failure::new(error.kind(), error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub session_id: Option<Uuid>,
    pub output: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub interactive: bool,
    #[serde(flatten)]
    pub failure: Option<Failure>,
    pub metrics: Option<Metrics>,
}

impl SubmitResponse {
    fn rejected(failure: Failure) -> Self {
        Self {
            success: false,
            session_id: None,
            output: String::new(),
            stderr: String::new(),
            output_truncated: false,
            interactive: false,
            failure: Some(failure),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub success: bool,
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

impl Ack {
    fn from_result(result: Result<(), Failure>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                failure: None,
            },
            Err(failure) => Self {
                success: false,
                failure: Some(failure),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputResponse {
    pub success: bool,
    pub output: String,
    pub stderr: String,
    pub waiting_for_input: bool,
    pub session_ended: bool,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateResponse {
    pub success: bool,
    pub language: Option<Language>,
    pub template: Option<String>,
    #[serde(flatten)]
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub live_sessions: usize,
}

/// The sandbox core behind string-typed, never-failing operations.
///
/// Owns the idle-session reaper, which stops when the service is dropped.
#[derive(Debug)]
pub struct Service {
    runner: Runner,
    reaper: JoinHandle<()>,
}

impl Service {
    /// Build the core from configuration. Must be called inside a tokio
    /// runtime.
    pub fn new(config: Config) -> Result<Self, InitError> {
        Ok(Self::from_runner(Runner::new(config)?))
    }

    pub fn from_runner(runner: Runner) -> Self {
        let reaper = runner.sessions().spawn_reaper();
        Self { runner, reaper }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Compile and run `source`, interactively if it looks like it reads input
    #[instrument(skip(self, source, stdin, limits))]
    pub async fn submit(
        &self,
        source: &str,
        language: &str,
        stdin: Option<&str>,
        limits: Option<ResourceLimits>,
    ) -> SubmitResponse {
        let language = match parse_language(language) {
            Ok(language) => language,
            Err(failure) => return SubmitResponse::rejected(failure),
        };

        let mut request = CompilationRequest::new(source, language);
        request.stdin = stdin.map(str::to_owned);
        request.limits = limits;
        let result = self.runner.compile_and_run(request).await;

        SubmitResponse {
            success: result.success,
            session_id: result.session_id,
            output: result.stdout,
            stderr: result.stderr,
            output_truncated: result.output_truncated,
            interactive: result.interactive,
            failure: result.error.as_ref().map(Failure::from),
            metrics: Some(result.metrics),
        }
    }

    /// Compile and always start an interactive session
    pub async fn start_session(&self, source: &str, language: &str) -> SubmitResponse {
        let language = match parse_language(language) {
            Ok(language) => language,
            Err(failure) => return SubmitResponse::rejected(failure),
        };
        let result = self.runner.start_session(source, language, None).await;
        SubmitResponse {
            success: result.success,
            session_id: result.session_id,
            output: result.stdout,
            stderr: result.stderr,
            output_truncated: result.output_truncated,
            interactive: result.interactive,
            failure: result.error.as_ref().map(Failure::from),
            metrics: Some(result.metrics),
        }
    }

    pub async fn send_input(&self, session_id: &str, text: &str) -> Ack {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.runner.sessions().send(id, text).await.map_err(Failure::from)
        }
        .await;
        Ack::from_result(result)
    }

    pub async fn get_output(&self, session_id: &str) -> OutputResponse {
        let result = async {
            let id = parse_session_id(session_id)?;
            self.runner.sessions().drain(id).await.map_err(Failure::from)
        }
        .await;

        match result {
            Ok(output) => OutputResponse {
                success: true,
                output: output.stdout,
                stderr: output.stderr,
                waiting_for_input: output.waiting_for_input,
                session_ended: output.session_ended,
                truncated: output.truncated,
                exit_code: output.exit_code,
                failure: None,
            },
            Err(failure) => OutputResponse {
                success: false,
                output: String::new(),
                stderr: String::new(),
                waiting_for_input: false,
                session_ended: false,
                truncated: false,
                exit_code: None,
                failure: Some(failure),
            },
        }
    }

    /// End a session. Ending one that is already gone succeeds.
    pub async fn end_session(&self, session_id: &str) -> Ack {
        let result = async {
            let id = parse_session_id(session_id)?;
            if !self.runner.sessions().end(id).await {
                debug!(session_id = %id, "session already ended");
            }
            Ok::<(), Failure>(())
        }
        .await;
        Ack::from_result(result)
    }

    pub fn get_template(&self, language: &str) -> TemplateResponse {
        match parse_language(language) {
            Ok(language) => TemplateResponse {
                success: true,
                language: Some(language),
                template: Some(language.template().to_owned()),
                failure: None,
            },
            Err(failure) => TemplateResponse {
                success: false,
                language: None,
                template: None,
                failure: Some(failure),
            },
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            scheduler: self.runner.scheduler().stats(),
            cache: self.runner.cache().stats(),
            live_sessions: self.runner.sessions().len(),
        }
    }

    /// End every live session
    pub async fn shutdown(&self) -> usize {
        self.runner.sessions().shutdown().await
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

fn parse_language(language: &str) -> Result<Language, Failure> {
    language
        .parse()
        .map_err(|_| Failure::new(ErrorKind::InvalidRequest, format!("unsupported language '{language}'")))
}

fn parse_session_id(session_id: &str) -> Result<Uuid, Failure> {
    Uuid::parse_str(session_id.trim())
        .map_err(|_| Failure::new(ErrorKind::InvalidSession, format!("invalid session: {session_id}")))
}
