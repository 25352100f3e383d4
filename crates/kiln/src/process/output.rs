//! Batch execution: feed stdin once, capture bounded stdout and stderr

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::process::{CommandSpec, MonitorReport, ProcessError, ProcessGroup, ProcessMonitor, Violation, WatchSpec};

/// Captured result of one supervised batch run
#[derive(Debug)]
pub struct BatchOutput {
    /// `None` when the process had to be killed past the hard cutoff and
    /// could not be reaped
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
    pub report: MonitorReport,
}

impl BatchOutput {
    pub fn success(&self) -> bool {
        self.report.violation.is_none() && self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Signal that terminated the process, if any
    pub fn signal(&self) -> Option<i32> {
        self.status.and_then(|s| s.signal())
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `command` to completion under a [`ProcessMonitor`].
///
/// The optional stdin is written once and the pipe closed. Each output
/// stream keeps at most `max_output_bytes`; the rest is read and dropped so
/// the child never blocks on a full pipe. Whatever is left of the process
/// group afterwards is terminated.
#[instrument(skip(command, stdin, spec), fields(program = %command.program))]
pub async fn run_batch(
    command: &CommandSpec,
    stdin: Option<&[u8]>,
    spec: WatchSpec,
    max_output_bytes: usize,
) -> Result<BatchOutput, ProcessError> {
    let started = Instant::now();
    let mut child = command.spawn()?;
    let group = Arc::new(ProcessGroup::of(&child)?);
    let grace = spec.kill_grace;
    let cutoff = spec.hard_cutoff();
    let monitor = ProcessMonitor::watch(group.clone(), spec)?;

    debug!(pgid = group.id(), args = ?command.args, "spawned batch process");

    let input = stdin.map(<[u8]>::to_vec).unwrap_or_default();
    let stdin_pipe = child.stdin.take();
    let writer = tokio::spawn(async move {
        if let Some(mut pipe) = stdin_pipe {
            // A child that exits without reading its input closes the pipe
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        }
    });

    let stdout = child.stdout.take().map(|r| tokio::spawn(read_limited(r, max_output_bytes)));
    let stderr = child.stderr.take().map(|r| tokio::spawn(read_limited(r, max_output_bytes)));

    let mut hard_timeout = false;
    let status = match tokio::time::timeout(cutoff, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            group.terminate(grace).await;
            monitor.finish().await;
            return Err(ProcessError::Io(e));
        }
        Err(_) => {
            warn!(pgid = group.id(), "process outlived its monitor, killing");
            hard_timeout = true;
            group.terminate(grace).await;
            tokio::time::timeout(grace, child.wait()).await.ok().and_then(Result::ok)
        }
    };

    let mut report = monitor.finish().await;
    if hard_timeout && report.violation.is_none() {
        report.violation = Some(Violation::Timeout { limit: cutoff });
    }

    // Background children may still hold the output pipes open
    group.terminate(grace).await;
    writer.abort();

    let (stdout, stdout_truncated) = collect(stdout, grace).await;
    let (stderr, stderr_truncated) = collect(stderr, grace).await;

    let output = BatchOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed: started.elapsed(),
        report,
    };

    debug!(
        exit_code = ?output.exit_code(),
        signal = ?output.signal(),
        violation = ?output.report.violation,
        peak_memory = output.report.peak_memory_bytes,
        elapsed_ms = output.elapsed.as_millis() as u64,
        "batch process finished"
    );

    Ok(output)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
    wait: Duration,
) -> (Vec<u8>, bool) {
    let Some(task) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(wait, task).await {
        Ok(Ok(captured)) => captured,
        _ => (Vec::new(), false),
    }
}

/// Read `reader` to EOF, keeping the first `limit` bytes.
///
/// Returns the kept bytes and whether anything was dropped.
pub(crate) async fn read_limited<R>(mut reader: R, limit: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = limit.saturating_sub(out.len());
                if n > remaining {
                    truncated = true;
                }
                out.extend_from_slice(&chunk[..remaining.min(n)]);
            }
            Err(_) => break,
        }
    }
    (out, truncated)
}
