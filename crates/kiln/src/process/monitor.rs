//! Supervision of one process group
//!
//! A monitor is a small state machine driven by a single interval timer.
//! Each tick checks, in order, the wall clock, whether the group leader has
//! exited, and the group's resident memory. CPU usage is only logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::process::procfs::{self, GroupUsage};
use crate::process::{ProcessError, ProcessGroup};

/// Limits enforced on one supervised process group
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub cpu_warn_percent: f64,
}

impl WatchSpec {
    pub fn new(config: &MonitorConfig, timeout: Duration, memory_limit_mb: u64) -> Self {
        Self {
            timeout,
            memory_limit_bytes: memory_limit_mb.saturating_mul(1024 * 1024),
            poll_interval: config.poll_interval(),
            kill_grace: config.kill_grace(),
            cpu_warn_percent: config.cpu_warn_percent,
        }
    }

    /// Ceiling after which the caller stops trusting the monitor and
    /// terminates the group itself
    pub fn hard_cutoff(&self) -> Duration {
        self.timeout + self.kill_grace + self.poll_interval * 4
    }
}

/// Why a monitor terminated its process group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Timeout { limit: Duration },
    MemoryLimit { limit_bytes: u64, observed_bytes: u64 },
}

/// What a monitor observed over its lifetime
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub violation: Option<Violation>,
    pub peak_memory_bytes: u64,
    pub elapsed: Duration,
}

/// Outcome of one supervision tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    Exited,
    Violated(Violation),
}

/// Decide what a tick should do. Timeout wins over exit, exit over memory.
pub(crate) fn evaluate(
    spec: &WatchSpec,
    elapsed: Duration,
    leader_exited: bool,
    usage: GroupUsage,
) -> Verdict {
    if elapsed > spec.timeout {
        return Verdict::Violated(Violation::Timeout {
            limit: spec.timeout,
        });
    }
    if leader_exited {
        return Verdict::Exited;
    }
    if usage.rss_bytes > spec.memory_limit_bytes {
        return Verdict::Violated(Violation::MemoryLimit {
            limit_bytes: spec.memory_limit_bytes,
            observed_bytes: usage.rss_bytes,
        });
    }
    Verdict::Continue
}

/// Attaches monitors to process groups
pub struct ProcessMonitor;

impl ProcessMonitor {
    /// Start supervising `group`.
    ///
    /// Fails if another monitor is already attached to the group.
    pub fn watch(group: Arc<ProcessGroup>, spec: WatchSpec) -> Result<MonitorHandle, ProcessError> {
        if !group.claim_monitor() {
            return Err(ProcessError::AlreadyMonitored(group.id()));
        }

        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(supervise(group.clone(), spec, stop.clone()));

        Ok(MonitorHandle { stop, task, group })
    }
}

async fn supervise(group: Arc<ProcessGroup>, spec: WatchSpec, stop: Arc<Notify>) -> MonitorReport {
    let pgid = group.id();
    let started = Instant::now();
    let mut report = MonitorReport::default();
    let mut last_cpu: Option<(Instant, u64)> = None;

    let mut interval = tokio::time::interval(spec.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => break,
            _ = interval.tick() => {}
        }

        // Someone else already took the group down
        if group.is_terminated() {
            break;
        }

        let elapsed = started.elapsed();
        let leader_exited = procfs::read_stat(pgid).is_none_or(|stat| stat.is_exited());
        let usage = procfs::group_usage(pgid).unwrap_or_else(|e| {
            debug!(pgid, error = %e, "failed to sample process group");
            GroupUsage::default()
        });
        report.peak_memory_bytes = report.peak_memory_bytes.max(usage.rss_bytes);

        let now = Instant::now();
        if let Some((at, ticks)) = last_cpu {
            let wall = now.duration_since(at).as_secs_f64();
            if wall > 0.0 {
                let cpu_seconds =
                    usage.cpu_ticks.saturating_sub(ticks) as f64 / procfs::clock_ticks() as f64;
                let percent = cpu_seconds / wall * 100.0;
                if percent > spec.cpu_warn_percent {
                    debug!(pgid, cpu_percent = percent, "high CPU usage");
                }
            }
        }
        last_cpu = Some((now, usage.cpu_ticks));

        match evaluate(&spec, elapsed, leader_exited, usage) {
            Verdict::Continue => {}
            Verdict::Exited => break,
            Verdict::Violated(violation) => {
                match violation {
                    Violation::Timeout { limit } => {
                        warn!(pgid, limit_ms = limit.as_millis() as u64, "process timed out");
                    }
                    Violation::MemoryLimit {
                        limit_bytes,
                        observed_bytes,
                    } => {
                        warn!(pgid, limit_bytes, observed_bytes, "memory limit exceeded");
                    }
                }
                report.violation = Some(violation);
                group.terminate(spec.kill_grace).await;
                break;
            }
        }
    }

    report.elapsed = started.elapsed();
    report
}

/// Handle to a running monitor
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<Notify>,
    task: JoinHandle<MonitorReport>,
    group: Arc<ProcessGroup>,
}

impl MonitorHandle {
    /// The supervised group
    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    /// Ask the monitor to stop at its next tick. Idempotent.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Whether the monitor loop has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the monitor and collect its report.
    ///
    /// A monitor that panicked yields an empty report; the caller's own hard
    /// cutoff still bounds the process.
    pub async fn finish(self) -> MonitorReport {
        self.stop();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(pgid = self.group.id(), error = %e, "process monitor failed");
                MonitorReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandSpec;

    fn spec(timeout_ms: u64, memory_limit_bytes: u64) -> WatchSpec {
        WatchSpec {
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_bytes,
            poll_interval: Duration::from_millis(20),
            kill_grace: Duration::from_millis(200),
            cpu_warn_percent: 90.0,
        }
    }

    fn usage(rss_bytes: u64) -> GroupUsage {
        GroupUsage {
            members: 1,
            rss_bytes,
            cpu_ticks: 0,
        }
    }

    #[test]
    fn evaluate_continues_within_limits() {
        let verdict = evaluate(&spec(1000, 1 << 20), Duration::from_millis(10), false, usage(10));
        assert_eq!(verdict, Verdict::Continue);
    }

    #[test]
    fn evaluate_times_out_before_anything_else() {
        let verdict = evaluate(&spec(100, 1), Duration::from_millis(101), true, usage(1 << 30));
        assert_eq!(
            verdict,
            Verdict::Violated(Violation::Timeout {
                limit: Duration::from_millis(100)
            })
        );
    }

    #[test]
    fn evaluate_exit_wins_over_memory() {
        let verdict = evaluate(&spec(1000, 1), Duration::ZERO, true, usage(1 << 30));
        assert_eq!(verdict, Verdict::Exited);
    }

    #[test]
    fn evaluate_memory_violation() {
        let verdict = evaluate(&spec(1000, 100), Duration::ZERO, false, usage(101));
        assert_eq!(
            verdict,
            Verdict::Violated(Violation::MemoryLimit {
                limit_bytes: 100,
                observed_bytes: 101
            })
        );
    }

    #[test]
    fn hard_cutoff_exceeds_timeout() {
        let spec = spec(1000, 1);
        assert!(spec.hard_cutoff() > spec.timeout + spec.kill_grace);
    }

    #[tokio::test]
    async fn monitor_terminates_on_timeout() {
        let mut child = CommandSpec::new("sleep").arg("30").spawn().unwrap();
        let group = Arc::new(ProcessGroup::of(&child).unwrap());
        let handle = ProcessMonitor::watch(group.clone(), spec(200, u64::MAX)).unwrap();

        let started = Instant::now();
        let status = child.wait().await.unwrap();
        let report = handle.finish().await;

        assert!(!status.success());
        assert!(matches!(report.violation, Some(Violation::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(group.is_terminated());
    }

    #[tokio::test]
    async fn monitor_stops_cleanly_on_exit() {
        let mut child = CommandSpec::new("true").spawn().unwrap();
        let group = Arc::new(ProcessGroup::of(&child).unwrap());
        let handle = ProcessMonitor::watch(group.clone(), spec(5000, u64::MAX)).unwrap();

        child.wait().await.unwrap();
        let report = handle.finish().await;
        assert!(report.violation.is_none());
        assert!(!group.is_terminated());
    }

    #[tokio::test]
    async fn second_monitor_is_rejected() {
        let mut child = CommandSpec::new("sleep").arg("5").spawn().unwrap();
        let group = Arc::new(ProcessGroup::of(&child).unwrap());
        let first = ProcessMonitor::watch(group.clone(), spec(5000, u64::MAX)).unwrap();

        let second = ProcessMonitor::watch(group.clone(), spec(5000, u64::MAX));
        assert!(matches!(second, Err(ProcessError::AlreadyMonitored(_))));

        group.terminate(Duration::from_millis(100)).await;
        child.wait().await.unwrap();
        first.finish().await;
    }
}
