//! Execution step: batch runs and session hand-off

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::diagnostics::{describe_runtime_error, is_out_of_memory};
use crate::process::{BatchOutput, Violation, WatchSpec};
use crate::runner::{Compiled, RunError, Runner};
use crate::session::SessionError;
use crate::types::{MetricsRecorder, ResourceLimits};

/// Captured output of a batch run and the failure it ended in, if any
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub error: Option<RunError>,
}

/// Run a compiled program to completion on a worker slot.
///
/// Program failures land in [`BatchOutcome::error`] next to the output the
/// program produced; `Err` is reserved for failures to run it at all.
#[instrument(skip_all, fields(hash = compiled.hash.short()))]
pub(crate) async fn run_batch(
    runner: &Runner,
    compiled: &Compiled,
    source: &str,
    stdin: &[u8],
    limits: &ResourceLimits,
    metrics: &mut MetricsRecorder,
) -> Result<BatchOutcome, RunError> {
    let toolchain = runner.toolchains().get(compiled.language);
    let memory_limit_mb = limits.memory_limit_mb();
    let command = toolchain.run_command(&compiled.artifact_dir(), source, memory_limit_mb);
    let spec = WatchSpec::new(
        &runner.config().monitor,
        limits.execution_timeout(),
        memory_limit_mb + toolchain.runtime_overhead_mb(),
    );

    let permit = runner.scheduler().acquire().await.map_err(RunError::internal)?;
    metrics.event("running");
    let output = crate::process::run_batch(&command, Some(stdin), spec, limits.max_output_bytes()).await;
    drop(permit);
    let output = output?;

    metrics.add_execution_time(output.elapsed);
    metrics.observe_memory(output.report.peak_memory_bytes);

    let error = classify(&output, limits);
    debug!(
        exit_code = ?output.exit_code(),
        error = ?error.as_ref().map(RunError::kind),
        elapsed_ms = output.elapsed.as_millis() as u64,
        "batch run finished"
    );

    Ok(BatchOutcome {
        stdout: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        truncated: output.stdout_truncated || output.stderr_truncated,
        error,
    })
}

/// Map a finished run onto the failure taxonomy
fn classify(output: &BatchOutput, limits: &ResourceLimits) -> Option<RunError> {
    match output.report.violation {
        Some(Violation::Timeout { .. }) => {
            return Some(RunError::ExecutionTimeout {
                limit_secs: limits.execution_timeout().as_secs_f64(),
            });
        }
        Some(Violation::MemoryLimit { observed_bytes, .. }) => {
            return Some(RunError::MemoryLimitExceeded {
                limit_mb: limits.memory_limit_mb(),
                peak_bytes: observed_bytes,
            });
        }
        None => {}
    }

    if output.success() {
        return None;
    }

    let stderr = output.stderr_lossy();
    if is_out_of_memory(&stderr) {
        return Some(RunError::MemoryLimitExceeded {
            limit_mb: limits.memory_limit_mb(),
            peak_bytes: output.report.peak_memory_bytes,
        });
    }

    Some(RunError::Runtime {
        message: describe_runtime_error(&stderr, output.exit_code(), output.signal()),
        exit_code: output.exit_code(),
        signal: output.signal(),
        stderr,
    })
}

/// Launch a compiled program and register it as an interactive session
pub(crate) fn start_session(
    runner: &Runner,
    compiled: Compiled,
    source: &str,
    limits: &ResourceLimits,
) -> Result<Uuid, RunError> {
    let toolchain = runner.toolchains().get(compiled.language);
    let memory_limit_mb = limits.memory_limit_mb();
    let command = toolchain.run_command(&compiled.artifact_dir(), source, memory_limit_mb);
    let spec = WatchSpec::new(
        &runner.config().monitor,
        limits.session_timeout(),
        memory_limit_mb + toolchain.runtime_overhead_mb(),
    );

    runner
        .sessions()
        .start(command, compiled.workspace, spec)
        .map_err(|error| match error {
            SessionError::Process(process) => RunError::from(process),
            other => RunError::internal(other),
        })
}
