//! A library for compiling and running untrusted code on the host.
//!
//! Kiln takes C, C++ and Java submissions through compilation and execution
//! under wall-clock and memory limits, supervising every program as a whole
//! process group. Programs that read console input are handed to
//! long-lived interactive sessions instead of running to completion.
//!
//! # Features
//!
//! - **Build cache**: content-addressed artifacts with LRU eviction.
//! - **Process monitor**: timeout and memory enforcement with group kill.
//! - **Adaptive scheduling**: worker pool sized from sampled host load.
//! - **Interactive sessions**: buffered output, prompt detection, idle reaping.
//! - **TOML configuration**: limits, thresholds and toolchain commands.

pub use cache::{BuildCache, CacheError, CacheStats, SourceHash};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use process::{CommandSpec, ProcessError, ProcessGroup, ProcessMonitor, Violation, WatchSpec};
pub use resources::{LoadLevel, LoadSample, ResourceMonitor};
pub use runner::{Compiled, ErrorKind, InitError, RunError, Runner};
pub use scheduler::{Scheduler, SchedulerStats};
pub use service::Service;
pub use session::{SessionError, SessionManager, SessionOutput, SessionState};
pub use toolchain::{Toolchain, Toolchains};
pub use types::{CompilationRequest, CompilationResult, Metrics, ResourceLimits, RunMode};

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod heuristics;
pub mod process;
pub mod resources;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod toolchain;
pub mod types;
pub mod workspace;
