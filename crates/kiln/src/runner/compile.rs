//! Compilation step
//!
//! Resolves a source to a runnable artifact inside a fresh workspace, either
//! by checking it out of the build cache or by running the toolchain's
//! compiler under a process monitor.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::cache::SourceHash;
use crate::config::Language;
use crate::diagnostics::format_compile_error;
use crate::process::{BatchOutput, Violation, WatchSpec, run_batch};
use crate::runner::{RunError, Runner};
use crate::toolchain::Toolchain;
use crate::types::{MetricsRecorder, ResourceLimits};
use crate::workspace::Workspace;

/// A compiled program checked out into its own workspace.
///
/// Dropping it removes the workspace.
#[derive(Debug)]
pub struct Compiled {
    pub language: Language,
    pub workspace: Workspace,
    pub hash: SourceHash,
    pub cached: bool,
    pub compilation_time: Duration,
    /// Compiler warnings of a fresh build
    pub diagnostics: String,
}

impl Compiled {
    /// Directory holding the runnable artifact
    pub fn artifact_dir(&self) -> PathBuf {
        self.workspace.artifact_dir()
    }
}

#[instrument(skip(runner, source, limits, metrics), fields(hash = tracing::field::Empty))]
pub(crate) async fn compile(
    runner: &Runner,
    source: &str,
    language: Language,
    limits: &ResourceLimits,
    metrics: &mut MetricsRecorder,
) -> Result<Compiled, RunError> {
    let hash = SourceHash::of(language, source);
    tracing::Span::current().record("hash", hash.short());

    let workspace = Workspace::create(&runner.config().workspace_root()).map_err(RunError::internal)?;

    if runner.cache().checkout(&hash, &workspace.artifact_dir()).await {
        metrics.mark_cached();
        metrics.event("cache_hit");
        return Ok(Compiled {
            language,
            workspace,
            hash,
            cached: true,
            compilation_time: Duration::ZERO,
            diagnostics: String::new(),
        });
    }
    metrics.event("cache_miss");

    let toolchain = runner.toolchains().get(language);
    let source_name = toolchain.source_name(source);
    workspace
        .write_file(&source_name, source.as_bytes())
        .await
        .map_err(RunError::internal)?;

    let permit = runner.scheduler().acquire().await.map_err(RunError::internal)?;
    metrics.event("compiling");
    debug!(pool_size = permit.pool_size, level = %permit.level, "compiling");

    let started = Instant::now();
    let workspace_path = workspace.path();
    let source_name = source_name.as_str();
    let spec = WatchSpec::new(
        &runner.config().monitor,
        limits.compile_timeout(),
        limits.compile_memory_limit_mb(),
    );
    let output = runner
        .scheduler()
        .with_retries(
            |error| matches!(error, RunError::CompilationTimeout { .. }),
            |attempt| run_compiler(toolchain, workspace_path, source_name, spec.clone(), limits, attempt),
        )
        .await;
    drop(permit);

    let compilation_time = started.elapsed();
    metrics.add_compilation_time(compilation_time);
    let output = output?;

    let files = toolchain
        .artifact_files(workspace.path())
        .map_err(RunError::internal)?;
    install_artifact(&files, &workspace.artifact_dir())
        .await
        .map_err(RunError::internal)?;

    // The request proceeds with its own copy whether or not caching works
    if let Err(e) = runner.cache().store(&hash, &files).await {
        warn!(error = %e, "failed to cache artifact");
    }

    metrics.event("compiled");
    debug!(elapsed_ms = compilation_time.as_millis() as u64, "compilation complete");

    Ok(Compiled {
        language,
        workspace,
        hash,
        cached: false,
        compilation_time,
        diagnostics: output.stderr_lossy(),
    })
}

async fn run_compiler(
    toolchain: &dyn Toolchain,
    workspace: &Path,
    source_name: &str,
    spec: WatchSpec,
    limits: &ResourceLimits,
    attempt: u32,
) -> Result<BatchOutput, RunError> {
    let command = toolchain.compile_command(workspace, source_name);
    debug!(attempt, program = %command.program, args = ?command.args, "running compiler");

    let output = run_batch(&command, None, spec, limits.max_output_bytes()).await?;
    match output.report.violation {
        Some(Violation::Timeout { .. }) => {
            return Err(RunError::CompilationTimeout {
                limit_secs: limits.compile_timeout().as_secs_f64(),
            });
        }
        Some(Violation::MemoryLimit { observed_bytes, .. }) => {
            return Err(RunError::MemoryLimitExceeded {
                limit_mb: limits.compile_memory_limit_mb(),
                peak_bytes: observed_bytes,
            });
        }
        None => {}
    }

    if output.success() {
        return Ok(output);
    }

    let mut raw = output.stderr_lossy();
    if raw.trim().is_empty() {
        raw = output.stdout_lossy();
    }
    Err(RunError::Compilation {
        message: format_compile_error(&raw, workspace, output.exit_code()),
        raw,
        exit_code: output.exit_code(),
    })
}

/// Copy compiler outputs into the artifact directory
async fn install_artifact(files: &[PathBuf], artifact_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(artifact_dir).await?;
    for file in files {
        if let Some(name) = file.file_name() {
            tokio::fs::copy(file, artifact_dir.join(name)).await?;
        }
    }
    Ok(())
}
