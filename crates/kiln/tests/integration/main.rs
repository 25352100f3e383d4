//! Integration tests for kiln
//!
//! These tests compile and run real programs, so they need `g++` and `gcc`
//! on the PATH. Run with: cargo test -p kiln --features integration-tests
//!
//! Java tests additionally need a JDK and are marked `#[ignore]`. To include
//! them:
//!    cargo test -p kiln --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln::config::Config;
use kiln::resources::LoadProbe;
use kiln::{LoadSample, ResourceMonitor, Runner, Service, SessionOutput};
use uuid::Uuid;

mod cache;
mod compile_and_run;
mod config_loading;
mod interactive;
mod limits;
mod scheduling;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Host load that never changes
pub(crate) struct IdleHost;

impl LoadProbe for IdleHost {
    fn sample(&self) -> io::Result<LoadSample> {
        Ok(LoadSample {
            cpu_percent: 5.0,
            memory_percent: 20.0,
            memory_available_mb: 8192,
        })
    }
}

/// Default config with workspaces and the build cache under `root`
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.workspace_root = Some(root.join("work"));
    config.cache.dir = Some(root.join("cache"));
    config.scheduler.cpu_count = Some(2);
    config.monitor.kill_grace_ms = 200;
    config
}

pub(crate) fn runner_with(config: Config) -> Runner {
    let monitor = Arc::new(ResourceMonitor::with_probe(&config.scheduler, Arc::new(IdleHost)));
    Runner::with_monitor(config, monitor).expect("Failed to create runner")
}

pub(crate) fn test_runner(root: &Path) -> Runner {
    runner_with(test_config(root))
}

pub(crate) fn test_service(root: &Path) -> Service {
    Service::from_runner(test_runner(root))
}

/// Poll a session until `done` holds for everything drained so far
pub(crate) async fn drain_until(
    runner: &Runner,
    session_id: Uuid,
    done: impl Fn(&SessionOutput) -> bool,
) -> SessionOutput {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = SessionOutput::default();
    loop {
        let output = runner
            .sessions()
            .drain(session_id)
            .await
            .expect("Failed to drain session");
        seen.stdout.push_str(&output.stdout);
        seen.stderr.push_str(&output.stderr);
        seen.waiting_for_input = output.waiting_for_input;
        seen.session_ended = output.session_ended;
        seen.exit_code = output.exit_code;
        if done(&seen) || seen.session_ended || Instant::now() > deadline {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
