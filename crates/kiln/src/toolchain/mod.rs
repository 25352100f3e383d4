//! Per-language build and launch behaviour
//!
//! The orchestrator never branches on [`Language`]; it asks the
//! [`Toolchains`] registry for the language's [`Toolchain`] and uses the
//! commands it returns.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{Language, ToolchainsConfig};
use crate::process::{CommandSpec, ProcessError, resolve_program};

pub use crate::toolchain::java::JavaToolchain;
pub use crate::toolchain::native::NativeToolchain;

mod java;
mod native;

/// Compile and launch commands for one language
pub trait Toolchain: Send + Sync + fmt::Debug {
    fn language(&self) -> Language;

    /// Reject sources this toolchain cannot build into a runnable artifact
    fn check_source(&self, _source: &str) -> Result<(), String> {
        Ok(())
    }

    /// File name the source is written to inside the workspace
    fn source_name(&self, source: &str) -> String;

    /// Compiler invocation, run with the workspace as working directory
    fn compile_command(&self, workspace: &Path, source_name: &str) -> CommandSpec;

    /// Files a successful compilation produced; these form the cached artifact
    fn artifact_files(&self, workspace: &Path) -> io::Result<Vec<PathBuf>>;

    /// Launch command for an artifact checked out into `artifact_dir`
    fn run_command(&self, artifact_dir: &Path, source: &str, memory_limit_mb: u64) -> CommandSpec;

    /// Programs the toolchain needs on the host
    fn required_programs(&self) -> Vec<&str>;

    /// Resident memory the runtime itself needs on top of the program's limit
    fn runtime_overhead_mb(&self) -> u64 {
        0
    }
}

/// Registry of the configured toolchains
#[derive(Debug, Clone)]
pub struct Toolchains {
    cpp: NativeToolchain,
    c: NativeToolchain,
    java: JavaToolchain,
}

impl Toolchains {
    pub fn new(config: &ToolchainsConfig) -> Self {
        Self {
            cpp: NativeToolchain::new(Language::Cpp, config.cpp.clone()),
            c: NativeToolchain::new(Language::C, config.c.clone()),
            java: JavaToolchain::new(config.java.clone()),
        }
    }

    pub fn get(&self, language: Language) -> &dyn Toolchain {
        match language {
            Language::Cpp => &self.cpp,
            Language::C => &self.c,
            Language::Java => &self.java,
        }
    }

    /// Check that every program the language needs resolves through PATH
    pub fn check_available(&self, language: Language) -> Result<(), ProcessError> {
        for program in self.get(language).required_programs() {
            resolve_program(program)?;
        }
        Ok(())
    }
}

/// Replace `{memory_mb}` in each argument
pub(crate) fn expand_args(args: &[String], memory_limit_mb: u64) -> Vec<String> {
    let memory = memory_limit_mb.to_string();
    args.iter()
        .map(|arg| arg.replace("{memory_mb}", &memory))
        .collect()
}
