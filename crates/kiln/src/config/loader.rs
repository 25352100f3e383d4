//! Configuration file loading for kiln
//!
//! Layers the embedded defaults, an optional TOML file and `KILN__*`
//! environment variables using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};

impl Config {
    /// Load configuration from a file, on top of the embedded defaults,
    /// with environment overrides applied last
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml))
            .add_source(File::from(path))
            .add_source(environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the embedded defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml))
            .add_source(environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// Keys missing from `content` keep their embedded default.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        for (name, value) in [
            ("compile_timeout", limits.compile_timeout),
            ("execution_timeout", limits.execution_timeout),
            ("session_timeout", limits.session_timeout),
        ] {
            if let Some(seconds) = value
                && !(seconds > 0.0 && seconds.is_finite())
            {
                return Err(ConfigError::Invalid(format!(
                    "limits.{name} must be a positive number of seconds"
                )));
            }
        }
        if limits.memory_limit_mb == Some(0) || limits.compile_memory_limit_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "memory limits must be greater than zero".to_owned(),
            ));
        }

        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache bounds must be greater than zero".to_owned(),
            ));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_ms must be greater than zero".to_owned(),
            ));
        }

        if !(self.sessions.idle_timeout > 0.0 && self.sessions.reap_interval > 0.0) {
            return Err(ConfigError::Invalid(
                "session idle timeout and reap interval must be positive".to_owned(),
            ));
        }

        let scheduler = &self.scheduler;
        if scheduler.window == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.window must be greater than zero".to_owned(),
            ));
        }
        if scheduler.medium_threshold >= scheduler.high_threshold {
            return Err(ConfigError::Invalid(format!(
                "scheduler.medium_threshold ({}) must be below high_threshold ({})",
                scheduler.medium_threshold, scheduler.high_threshold
            )));
        }
        if scheduler.compile_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.compile_attempts must be at least 1".to_owned(),
            ));
        }

        let toolchains = &self.toolchains;
        for (id, compiler) in [
            ("cpp", &toolchains.cpp.compiler),
            ("c", &toolchains.c.compiler),
            ("java", &toolchains.java.javac),
            ("java", &toolchains.java.java),
        ] {
            if compiler.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "toolchain '{id}' has an empty command"
                )));
            }
        }
        for (id, source_name) in [
            ("cpp", &toolchains.cpp.source_name),
            ("c", &toolchains.c.source_name),
        ] {
            if source_name.contains('/') || source_name.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "toolchain '{id}' source name must be a plain file name"
                )));
            }
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
