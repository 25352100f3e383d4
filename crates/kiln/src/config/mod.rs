use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::config::language::{JavaConfig, Language, NativeConfig, ToolchainsConfig};
use crate::types::ResourceLimits;

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Also serves as the source of every default value.
pub const EXAMPLE_CONFIG: &str = include_str!("../../kiln.example.toml");

/// Prefix for environment overrides, e.g. `KILN__LIMITS__EXECUTION_TIMEOUT=3`
pub const ENV_PREFIX: &str = "KILN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' is not supported")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for kiln
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Parent directory for per-request temporary workspaces.
    /// Falls back to the system temp dir when unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    pub cache: CacheConfig,

    /// Default limits applied to compilation and execution
    pub limits: ResourceLimits,

    pub monitor: MonitorConfig,

    pub sessions: SessionConfig,

    pub scheduler: SchedulerConfig,

    pub toolchains: ToolchainsConfig,
}

/// Build cache location and eviction bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding one sub-directory per source hash.
    /// Falls back to `<temp>/kiln-cache` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Maximum number of artifacts kept before LRU eviction
    pub max_entries: usize,

    /// Maximum total artifact size in bytes before LRU eviction
    pub max_bytes: u64,
}

/// Process monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval between supervision ticks
    pub poll_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL when terminating a process group
    pub kill_grace_ms: u64,

    /// CPU usage above which a diagnostic is logged
    pub cpu_warn_percent: f64,
}

/// Interactive session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions without activity for this many seconds are reaped
    pub idle_timeout: f64,

    /// Seconds between reaper sweeps
    pub reap_interval: f64,

    /// Read timeout of the output-monitoring task
    pub read_timeout_ms: u64,

    /// Lines kept per stream before the oldest are dropped
    pub max_buffered_lines: usize,
}

/// Load-aware scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of load samples kept in the rolling window
    pub window: usize,

    /// Average usage (percent) above which load is `medium`
    pub medium_threshold: f64,

    /// Average usage (percent) above which load is `high`
    pub high_threshold: f64,

    /// CPU usage (percent) at which admissions are delayed
    pub throttle_cpu_percent: f64,

    /// Memory usage (percent) at which admissions are delayed
    pub throttle_memory_percent: f64,

    /// Delay applied to a throttled admission
    pub throttle_delay_ms: u64,

    /// Attempts for a compilation that hits a host-level timeout
    pub compile_attempts: u32,

    /// Backoff between compilation attempts
    pub retry_backoff_ms: u64,

    /// Override for the detected CPU count
    #[serde(default)]
    pub cpu_count: Option<usize>,
}

impl Config {
    /// Create a new config with embedded defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory for per-request workspaces
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Directory holding the build cache
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-cache"))
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        match overrides {
            Some(limits) => self.limits.with_overrides(limits),
            None => self.limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reap_interval)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl SchedulerConfig {
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_limits() {
        let config = Config::default();
        assert_eq!(config.limits.compile_timeout, Some(10.0));
        assert_eq!(config.limits.execution_timeout, Some(5.0));
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn default_config_has_every_toolchain() {
        let config = Config::default();
        assert_eq!(config.toolchains.cpp.compiler, "g++");
        assert_eq!(config.toolchains.c.compiler, "gcc");
        assert_eq!(config.toolchains.java.javac, "javac");
    }

    #[test]
    fn cache_dir_falls_back_to_temp() {
        let mut config = Config::default();
        config.cache.dir = None;
        assert_eq!(config.cache_dir(), std::env::temp_dir().join("kiln-cache"));
    }

    #[test]
    fn effective_limits_no_override() {
        let config = Config::default();
        let result = config.effective_limits(None);
        assert_eq!(result.execution_timeout, config.limits.execution_timeout);
        assert_eq!(result.memory_limit_mb, config.limits.memory_limit_mb);
    }

    #[test]
    fn effective_limits_partial_override() {
        let config = Config::default();
        let overrides = ResourceLimits {
            execution_timeout: Some(1.5),
            ..ResourceLimits::empty()
        };
        let result = config.effective_limits(Some(&overrides));
        assert_eq!(result.execution_timeout, Some(1.5));
        assert_eq!(result.memory_limit_mb, config.limits.memory_limit_mb);
    }
}
