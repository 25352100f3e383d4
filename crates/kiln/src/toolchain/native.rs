use std::io;
use std::path::{Path, PathBuf};

use crate::config::{Language, NativeConfig};
use crate::process::CommandSpec;
use crate::toolchain::Toolchain;

/// GCC-style toolchain producing a single executable
#[derive(Debug, Clone)]
pub struct NativeToolchain {
    language: Language,
    config: NativeConfig,
}

impl NativeToolchain {
    pub fn new(language: Language, config: NativeConfig) -> Self {
        Self { language, config }
    }
}

impl Toolchain for NativeToolchain {
    fn language(&self) -> Language {
        self.language
    }

    fn source_name(&self, _source: &str) -> String {
        self.config.source_name.clone()
    }

    fn compile_command(&self, workspace: &Path, source_name: &str) -> CommandSpec {
        CommandSpec::new(&self.config.compiler)
            .args(&self.config.flags)
            .arg(source_name)
            .arg("-o")
            .arg(&self.config.binary_name)
            .args(&self.config.link_flags)
            .env("LC_ALL", "C")
            .working_dir(workspace)
    }

    fn artifact_files(&self, workspace: &Path) -> io::Result<Vec<PathBuf>> {
        let binary = workspace.join(&self.config.binary_name);
        if !binary.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("compiler produced no '{}'", self.config.binary_name),
            ));
        }
        Ok(vec![binary])
    }

    fn run_command(&self, artifact_dir: &Path, _source: &str, _memory_limit_mb: u64) -> CommandSpec {
        let binary = artifact_dir.join(&self.config.binary_name);
        CommandSpec::new(binary.to_string_lossy()).working_dir(artifact_dir)
    }

    fn required_programs(&self) -> Vec<&str> {
        vec![self.config.compiler.as_str()]
    }
}
