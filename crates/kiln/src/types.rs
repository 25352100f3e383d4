use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::config::Language;
use crate::runner::RunError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall clock limit for compilation in seconds
    #[serde(default)]
    pub compile_timeout: Option<f64>,

    /// Wall clock limit for a batch run in seconds
    #[serde(default)]
    pub execution_timeout: Option<f64>,

    /// Wall clock ceiling for an interactive process in seconds
    #[serde(default)]
    pub session_timeout: Option<f64>,

    /// Resident memory ceiling for the program in megabytes
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Resident memory ceiling for the compiler in megabytes
    #[serde(default)]
    pub compile_memory_limit_mb: Option<u64>,

    /// Captured bytes per output stream in batch mode
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Largest accepted source text in bytes
    #[serde(default)]
    pub max_source_bytes: Option<usize>,
}

impl ResourceLimits {
    pub const DEFAULT_COMPILE_TIMEOUT: f64 = 10.0;
    pub const DEFAULT_EXECUTION_TIMEOUT: f64 = 5.0;
    pub const DEFAULT_SESSION_TIMEOUT: f64 = 600.0;
    pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;
    pub const DEFAULT_COMPILE_MEMORY_LIMIT_MB: u64 = 1024;
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
    pub const DEFAULT_MAX_SOURCE_BYTES: usize = 256 * 1024;

    /// Create new resource limits with the default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset, used as an override set
    pub fn empty() -> Self {
        Self {
            compile_timeout: None,
            execution_timeout: None,
            session_timeout: None,
            memory_limit_mb: None,
            compile_memory_limit_mb: None,
            max_output_bytes: None,
            max_source_bytes: None,
        }
    }

    /// Set the batch execution timeout in seconds
    pub fn with_execution_timeout(mut self, seconds: f64) -> Self {
        self.execution_timeout = Some(seconds);
        self
    }

    /// Set the compilation timeout in seconds
    pub fn with_compile_timeout(mut self, seconds: f64) -> Self {
        self.compile_timeout = Some(seconds);
        self
    }

    /// Set the program memory ceiling in megabytes
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            compile_timeout: overrides.compile_timeout.or(self.compile_timeout),
            execution_timeout: overrides.execution_timeout.or(self.execution_timeout),
            session_timeout: overrides.session_timeout.or(self.session_timeout),
            memory_limit_mb: overrides.memory_limit_mb.or(self.memory_limit_mb),
            compile_memory_limit_mb: overrides
                .compile_memory_limit_mb
                .or(self.compile_memory_limit_mb),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
            max_source_bytes: overrides.max_source_bytes.or(self.max_source_bytes),
        }
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.compile_timeout
                .unwrap_or(Self::DEFAULT_COMPILE_TIMEOUT),
        )
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.execution_timeout
                .unwrap_or(Self::DEFAULT_EXECUTION_TIMEOUT),
        )
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.session_timeout
                .unwrap_or(Self::DEFAULT_SESSION_TIMEOUT),
        )
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
            .unwrap_or(Self::DEFAULT_MEMORY_LIMIT_MB)
    }

    pub fn compile_memory_limit_mb(&self) -> u64 {
        self.compile_memory_limit_mb
            .unwrap_or(Self::DEFAULT_COMPILE_MEMORY_LIMIT_MB)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
            .unwrap_or(Self::DEFAULT_MAX_OUTPUT_BYTES)
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
            .unwrap_or(Self::DEFAULT_MAX_SOURCE_BYTES)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            compile_timeout: Some(Self::DEFAULT_COMPILE_TIMEOUT),
            execution_timeout: Some(Self::DEFAULT_EXECUTION_TIMEOUT),
            session_timeout: Some(Self::DEFAULT_SESSION_TIMEOUT),
            memory_limit_mb: Some(Self::DEFAULT_MEMORY_LIMIT_MB),
            compile_memory_limit_mb: Some(Self::DEFAULT_COMPILE_MEMORY_LIMIT_MB),
            max_output_bytes: Some(Self::DEFAULT_MAX_OUTPUT_BYTES),
            max_source_bytes: Some(Self::DEFAULT_MAX_SOURCE_BYTES),
        }
    }
}

/// How a submission should be executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Interactive when the source looks like it reads console input
    #[default]
    Auto,
    /// Always run to completion with the provided stdin
    Batch,
    /// Always hand the process to a session
    Interactive,
}

/// A submission: source text, its language and optional batch input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationRequest {
    pub source: String,
    pub language: Language,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    /// Overrides applied on top of the configured limits
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl CompilationRequest {
    pub fn new(source: impl Into<String>, language: Language) -> Self {
        Self {
            source: source.into(),
            language,
            stdin: None,
            mode: RunMode::Auto,
            limits: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Outcome of one submission. Built once and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CompilationResult {
    pub success: bool,

    /// Captured program output (batch mode only)
    pub stdout: String,

    /// Captured program diagnostics (batch mode only)
    pub stderr: String,

    /// Whether stdout or stderr hit the output cap
    pub output_truncated: bool,

    pub error: Option<RunError>,

    pub metrics: Metrics,

    /// Live session handle when the program runs interactively
    pub session_id: Option<Uuid>,

    pub interactive: bool,
}

impl CompilationResult {
    pub(crate) fn failed(error: RunError, metrics: Metrics) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            error: Some(error),
            metrics,
            session_id: None,
            interactive: false,
        }
    }
}

/// One status transition recorded while a request runs
#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub status: String,
}

/// Frozen timing and resource figures of one request
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// Unix time in milliseconds at which the request started
    pub started_at_ms: u64,

    #[serde(serialize_with = "serialize_secs")]
    pub compilation_time: Duration,

    #[serde(serialize_with = "serialize_secs")]
    pub execution_time: Duration,

    pub peak_memory_bytes: u64,

    pub events: Vec<MetricEvent>,

    pub cached: bool,

    #[serde(serialize_with = "serialize_secs")]
    pub total_time: Duration,
}

/// Accumulates metrics along a request's execution path.
///
/// [`finish`](Self::finish) consumes the recorder, so the total time is
/// stamped exactly once, after the final status is known.
#[derive(Debug)]
pub struct MetricsRecorder {
    started: Instant,
    started_at_ms: u64,
    compilation_time: Duration,
    execution_time: Duration,
    peak_memory_bytes: u64,
    events: Vec<MetricEvent>,
    cached: bool,
}

impl MetricsRecorder {
    pub fn start() -> Self {
        let started_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut recorder = Self {
            started: Instant::now(),
            started_at_ms,
            compilation_time: Duration::ZERO,
            execution_time: Duration::ZERO,
            peak_memory_bytes: 0,
            events: Vec::new(),
            cached: false,
        };
        recorder.event("received");
        recorder
    }

    /// Append a status label stamped with the elapsed time
    pub fn event(&mut self, status: impl Into<String>) {
        self.events.push(MetricEvent {
            elapsed: self.started.elapsed(),
            status: status.into(),
        });
    }

    pub fn add_compilation_time(&mut self, elapsed: Duration) {
        self.compilation_time += elapsed;
    }

    pub fn add_execution_time(&mut self, elapsed: Duration) {
        self.execution_time += elapsed;
    }

    pub fn observe_memory(&mut self, bytes: u64) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(bytes);
    }

    pub fn mark_cached(&mut self) {
        self.cached = true;
    }

    pub fn finish(mut self, status: &str) -> Metrics {
        self.event(status);
        Metrics {
            started_at_ms: self.started_at_ms,
            compilation_time: self.compilation_time,
            execution_time: self.execution_time,
            peak_memory_bytes: self.peak_memory_bytes,
            events: self.events,
            cached: self.cached,
            total_time: self.started.elapsed(),
        }
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    // ResourceLimits tests

    #[test]
    fn resource_limits_default_has_all_fields() {
        let limits = ResourceLimits::default();
        assert!(limits.compile_timeout.is_some());
        assert!(limits.execution_timeout.is_some());
        assert!(limits.session_timeout.is_some());
        assert!(limits.memory_limit_mb.is_some());
        assert!(limits.compile_memory_limit_mb.is_some());
        assert!(limits.max_output_bytes.is_some());
        assert!(limits.max_source_bytes.is_some());
    }

    #[test]
    fn resource_limits_builder_methods() {
        let limits = ResourceLimits::new()
            .with_execution_timeout(1.0)
            .with_compile_timeout(3.0)
            .with_memory_limit_mb(64);

        assert_eq!(limits.execution_timeout(), Duration::from_secs(1));
        assert_eq!(limits.compile_timeout(), Duration::from_secs(3));
        assert_eq!(limits.memory_limit_mb(), 64);
    }

    #[test]
    fn empty_limits_fall_back_to_constants() {
        let limits = ResourceLimits::empty();
        assert_eq!(limits.execution_timeout(), Duration::from_secs(5));
        assert_eq!(limits.memory_limit_mb(), 256);
        assert_eq!(limits.max_output_bytes(), 64 * 1024);
    }

    #[test]
    fn with_overrides_empty_preserves_base() {
        let base = ResourceLimits::default().with_memory_limit_mb(512);
        let result = base.with_overrides(&ResourceLimits::empty());
        assert_eq!(result.memory_limit_mb, Some(512));
        assert_eq!(result.execution_timeout, base.execution_timeout);
        assert_eq!(result.session_timeout, base.session_timeout);
    }

    #[test]
    fn with_overrides_partial_override() {
        let base = ResourceLimits::default();
        let overrides = ResourceLimits {
            execution_timeout: Some(0.5),
            ..ResourceLimits::empty()
        };
        let result = base.with_overrides(&overrides);
        assert_eq!(result.execution_timeout, Some(0.5));
        assert_eq!(result.compile_timeout, base.compile_timeout);
    }

    // MetricsRecorder tests

    #[test]
    fn recorder_stamps_total_time_on_finish() {
        let mut recorder = MetricsRecorder::start();
        recorder.event("compiling");
        std::thread::sleep(Duration::from_millis(2));
        let metrics = recorder.finish("completed");

        assert!(metrics.total_time > Duration::ZERO);
        let labels: Vec<_> = metrics.events.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(labels, ["received", "compiling", "completed"]);
    }

    #[test]
    fn recorder_events_are_ordered_by_elapsed_time() {
        let mut recorder = MetricsRecorder::start();
        recorder.event("a");
        recorder.event("b");
        let metrics = recorder.finish("done");
        assert!(
            metrics
                .events
                .windows(2)
                .all(|pair| pair[0].elapsed <= pair[1].elapsed)
        );
    }

    #[test]
    fn recorder_keeps_peak_memory() {
        let mut recorder = MetricsRecorder::start();
        recorder.observe_memory(10);
        recorder.observe_memory(30);
        recorder.observe_memory(20);
        assert_eq!(recorder.finish("done").peak_memory_bytes, 30);
    }

    #[test]
    fn recorder_accumulates_phase_durations() {
        let mut recorder = MetricsRecorder::start();
        recorder.add_compilation_time(Duration::from_millis(5));
        recorder.add_compilation_time(Duration::from_millis(7));
        recorder.add_execution_time(Duration::from_millis(3));
        recorder.mark_cached();
        let metrics = recorder.finish("done");
        assert_eq!(metrics.compilation_time, Duration::from_millis(12));
        assert_eq!(metrics.execution_time, Duration::from_millis(3));
        assert!(metrics.cached);
    }

    #[test]
    fn metrics_serialize_durations_as_seconds() {
        let mut recorder = MetricsRecorder::start();
        recorder.add_compilation_time(Duration::from_millis(1500));
        let metrics = recorder.finish("done");
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["compilation_time"], 1.5);
        assert_eq!(json["cached"], false);
    }

    #[test]
    fn request_builder() {
        let request = CompilationRequest::new("int main(){}", Language::Cpp)
            .with_stdin("1 2\n")
            .with_mode(RunMode::Batch);
        assert_eq!(request.stdin.as_deref(), Some("1 2\n"));
        assert_eq!(request.mode, RunMode::Batch);
        assert!(request.limits.is_none());
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn with_overrides_identity(
            compile in proptest::option::of(0.1f64..100.0),
            execution in proptest::option::of(0.1f64..100.0),
            memory in proptest::option::of(1u64..100_000),
            output in proptest::option::of(1usize..1_000_000),
        ) {
            let base = ResourceLimits {
                compile_timeout: compile,
                execution_timeout: execution,
                memory_limit_mb: memory,
                max_output_bytes: output,
                ..ResourceLimits::empty()
            };
            let result = base.with_overrides(&ResourceLimits::empty());
            prop_assert_eq!(result.compile_timeout, base.compile_timeout);
            prop_assert_eq!(result.execution_timeout, base.execution_timeout);
            prop_assert_eq!(result.memory_limit_mb, base.memory_limit_mb);
            prop_assert_eq!(result.max_output_bytes, base.max_output_bytes);
        }

        #[test]
        fn with_overrides_full_override(
            base_memory in proptest::option::of(1u64..100_000),
            override_memory in 1u64..100_000,
        ) {
            let base = ResourceLimits { memory_limit_mb: base_memory, ..ResourceLimits::empty() };
            let overrides = ResourceLimits { memory_limit_mb: Some(override_memory), ..ResourceLimits::empty() };
            prop_assert_eq!(base.with_overrides(&overrides).memory_limit_mb, Some(override_memory));
        }
    }
}
