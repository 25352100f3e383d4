//! Compilation and execution orchestration
//!
//! [`Runner`] takes a [`CompilationRequest`] through validation, the build
//! cache, compilation and either a batch run or a hand-off to the session
//! manager, and always answers with a [`CompilationResult`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use crate::runner::compile::Compiled;

mod compile;
mod execute;

use crate::cache::{BuildCache, CacheError};
use crate::config::{Config, ConfigError, Language};
use crate::heuristics::looks_interactive;
use crate::process::ProcessError;
use crate::resources::ResourceMonitor;
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::toolchain::Toolchains;
use crate::types::{CompilationRequest, CompilationResult, MetricsRecorder, ResourceLimits, RunMode};

/// Serializable tag of every failure the core reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    CompilationError,
    CompilationTimeout,
    RuntimeError,
    ExecutionTimeout,
    MemoryLimitExceeded,
    ToolchainUnavailable,
    InvalidSession,
    ProcessNotRunning,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::CompilationError => "compilation_error",
            ErrorKind::CompilationTimeout => "compilation_timeout",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::MemoryLimitExceeded => "memory_limit_exceeded",
            ErrorKind::ToolchainUnavailable => "toolchain_unavailable",
            ErrorKind::InvalidSession => "invalid_session",
            ErrorKind::ProcessNotRunning => "process_not_running",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Why a request failed
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("{message}")]
    Compilation {
        /// Cleaned, one-line description
        message: String,
        /// Compiler output as produced
        raw: String,
        exit_code: Option<i32>,
    },

    #[error("compilation timed out after {limit_secs}s")]
    CompilationTimeout { limit_secs: f64 },

    #[error("{message}")]
    Runtime {
        message: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("execution timed out after {limit_secs}s")]
    ExecutionTimeout { limit_secs: f64 },

    #[error("memory limit of {limit_mb} MB exceeded")]
    MemoryLimitExceeded { limit_mb: u64, peak_bytes: u64 },

    #[error("toolchain unavailable: '{program}' not found")]
    ToolchainUnavailable { program: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            RunError::Compilation { .. } => ErrorKind::CompilationError,
            RunError::CompilationTimeout { .. } => ErrorKind::CompilationTimeout,
            RunError::Runtime { .. } => ErrorKind::RuntimeError,
            RunError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            RunError::MemoryLimitExceeded { .. } => ErrorKind::MemoryLimitExceeded,
            RunError::ToolchainUnavailable { .. } => ErrorKind::ToolchainUnavailable,
            RunError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        RunError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(message: impl fmt::Display) -> Self {
        RunError::Internal {
            message: message.to_string(),
        }
    }
}

impl From<ProcessError> for RunError {
    fn from(error: ProcessError) -> Self {
        match error {
            ProcessError::NotFound(program) => RunError::ToolchainUnavailable { program },
            other => RunError::internal(other),
        }
    }
}

/// Errors that prevent a [`Runner`] from starting
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open build cache: {0}")]
    Cache(#[from] CacheError),
}

/// High-level entry point for compiling and running submissions
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<Config>,
    toolchains: Arc<Toolchains>,
    cache: Arc<BuildCache>,
    scheduler: Arc<Scheduler>,
    sessions: Arc<SessionManager>,
}

impl Runner {
    /// Create a runner sampling host load from `/proc`
    pub fn new(config: Config) -> Result<Self, InitError> {
        let monitor = Arc::new(ResourceMonitor::new(&config.scheduler));
        Self::with_monitor(config, monitor)
    }

    /// Create a runner with a caller-provided resource monitor
    pub fn with_monitor(config: Config, monitor: Arc<ResourceMonitor>) -> Result<Self, InitError> {
        config.validate()?;
        let cache = BuildCache::open(&config)?;
        info!(cache_dir = %cache.root().display(), entries = cache.stats().entries, "build cache ready");

        Ok(Self {
            toolchains: Arc::new(Toolchains::new(&config.toolchains)),
            cache: Arc::new(cache),
            scheduler: Arc::new(Scheduler::new(&config.scheduler, monitor)),
            sessions: Arc::new(SessionManager::new(&config)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn toolchains(&self) -> &Toolchains {
        &self.toolchains
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Reject requests before any process is spawned
    pub fn validate(&self, source: &str, language: Language, limits: &ResourceLimits) -> Result<(), RunError> {
        if source.trim().is_empty() {
            return Err(RunError::invalid("source is empty"));
        }
        let max = limits.max_source_bytes();
        if source.len() > max {
            return Err(RunError::invalid(format!(
                "source is {} bytes, the limit is {max}",
                source.len()
            )));
        }
        self.toolchains.get(language).check_source(source).map_err(RunError::invalid)?;
        Ok(())
    }

    /// Compile only, reusing the build cache
    pub async fn compile(
        &self,
        source: &str,
        language: Language,
        limits: Option<&ResourceLimits>,
    ) -> Result<Compiled, RunError> {
        let limits = self.config.effective_limits(limits);
        self.validate(source, language, &limits)?;
        let mut metrics = MetricsRecorder::start();
        compile::compile(self, source, language, &limits, &mut metrics).await
    }

    /// Compile the request and run it in batch mode or start a session.
    ///
    /// Never fails: every error is reported inside the result.
    #[instrument(skip(self, request), fields(language = %request.language, mode = ?request.mode))]
    pub async fn compile_and_run(&self, request: CompilationRequest) -> CompilationResult {
        let mut metrics = MetricsRecorder::start();
        let limits = self.config.effective_limits(request.limits.as_ref());

        if let Err(error) = self.validate(&request.source, request.language, &limits) {
            debug!(%error, "rejected request");
            return CompilationResult::failed(error, metrics.finish("rejected"));
        }

        let compiled = match compile::compile(self, &request.source, request.language, &limits, &mut metrics).await {
            Ok(compiled) => compiled,
            Err(error) => {
                debug!(kind = %error.kind(), "compilation failed");
                return CompilationResult::failed(error, metrics.finish("compilation_failed"));
            }
        };

        if self.wants_session(&request) {
            return match execute::start_session(self, compiled, &request.source, &limits) {
                Ok(session_id) => {
                    metrics.event("session_started");
                    CompilationResult {
                        success: true,
                        stdout: String::new(),
                        stderr: String::new(),
                        output_truncated: false,
                        error: None,
                        metrics: metrics.finish("interactive"),
                        session_id: Some(session_id),
                        interactive: true,
                    }
                }
                Err(error) => CompilationResult::failed(error, metrics.finish("session_failed")),
            };
        }

        let stdin = request.stdin.as_deref().unwrap_or_default();
        match execute::run_batch(self, &compiled, &request.source, stdin.as_bytes(), &limits, &mut metrics).await {
            Ok(outcome) => {
                let status = if outcome.error.is_some() { "failed" } else { "completed" };
                CompilationResult {
                    success: outcome.error.is_none(),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    output_truncated: outcome.truncated,
                    error: outcome.error,
                    metrics: metrics.finish(status),
                    session_id: None,
                    interactive: false,
                }
            }
            Err(error) => CompilationResult::failed(error, metrics.finish("failed")),
        }
    }

    /// Compile and always hand the program to a session
    pub async fn start_session(
        &self,
        source: impl Into<String>,
        language: Language,
        limits: Option<ResourceLimits>,
    ) -> CompilationResult {
        let mut request = CompilationRequest::new(source, language).with_mode(RunMode::Interactive);
        request.limits = limits;
        self.compile_and_run(request).await
    }

    /// Provided stdin means the caller expects a batch run
    fn wants_session(&self, request: &CompilationRequest) -> bool {
        match request.mode {
            RunMode::Batch => false,
            RunMode::Interactive => true,
            RunMode::Auto => {
                request.stdin.as_deref().is_none_or(str::is_empty)
                    && looks_interactive(&request.source, request.language)
            }
        }
    }
}
