use std::io;
use std::path::{Path, PathBuf};

use crate::config::{JavaConfig, Language};
use crate::process::CommandSpec;
use crate::toolchain::{Toolchain, expand_args};

/// Directory javac writes class files to, relative to the workspace
const CLASS_DIR: &str = "classes";

/// JVM memory beyond the heap: metaspace, code cache, thread stacks
const JVM_OVERHEAD_MB: u64 = 192;

/// `javac` + `java` toolchain
#[derive(Debug, Clone)]
pub struct JavaToolchain {
    config: JavaConfig,
}

impl JavaToolchain {
    pub fn new(config: JavaConfig) -> Self {
        Self { config }
    }

    /// Class to launch: the top-level public class, else the configured default
    pub fn main_class(&self, source: &str) -> String {
        public_class_name(source).unwrap_or_else(|| self.config.main_class.clone())
    }
}

impl Toolchain for JavaToolchain {
    fn language(&self) -> Language {
        Language::Java
    }

    /// Classes must sit in the unnamed package: the artifact is the flat
    /// set of class files and the launcher names an unqualified class
    fn check_source(&self, source: &str) -> Result<(), String> {
        match package_name(source) {
            Some(package) => Err(format!(
                "package declarations are not supported (found 'package {package}'), remove it"
            )),
            None => Ok(()),
        }
    }

    /// javac insists a public class lives in a file of the same name
    fn source_name(&self, source: &str) -> String {
        format!("{}.java", self.main_class(source))
    }

    fn compile_command(&self, workspace: &Path, source_name: &str) -> CommandSpec {
        CommandSpec::new(&self.config.javac)
            .args(&self.config.javac_flags)
            .arg("-d")
            .arg(CLASS_DIR)
            .arg(source_name)
            .env("LC_ALL", "C")
            .working_dir(workspace)
    }

    fn artifact_files(&self, workspace: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(workspace.join(CLASS_DIR))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "class") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "javac produced no class files"));
        }
        files.sort();
        Ok(files)
    }

    fn run_command(&self, artifact_dir: &Path, source: &str, memory_limit_mb: u64) -> CommandSpec {
        CommandSpec::new(&self.config.java)
            .args(expand_args(&self.config.jvm_flags, memory_limit_mb))
            .arg("-cp")
            .arg(artifact_dir.to_string_lossy())
            .arg(self.main_class(source))
            .working_dir(artifact_dir)
    }

    fn required_programs(&self) -> Vec<&str> {
        vec![self.config.javac.as_str(), self.config.java.as_str()]
    }

    fn runtime_overhead_mb(&self) -> u64 {
        JVM_OVERHEAD_MB
    }
}

/// Package named by a leading `package` declaration, skipping comments
fn package_name(source: &str) -> Option<String> {
    let mut in_block_comment = false;
    for line in source.lines() {
        let mut line = line.trim();
        if in_block_comment {
            match line.find("*/") {
                Some(end) => {
                    in_block_comment = false;
                    line = line[end + 2..].trim();
                }
                None => continue,
            }
        }
        if let Some(rest) = line.strip_prefix("/*") {
            match rest.find("*/") {
                Some(end) => line = rest[end + 2..].trim(),
                None => {
                    in_block_comment = true;
                    continue;
                }
            }
        }
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let rest = line.strip_prefix("package")?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let name = rest.split(';').next().unwrap_or(rest).trim();
        return Some(name.to_owned());
    }
    None
}

/// Name of the first `public class` (modifiers such as `final` allowed)
fn public_class_name(source: &str) -> Option<String> {
    let tokens: Vec<&str> = source
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .filter(|token| !token.is_empty())
        .collect();

    for (i, token) in tokens.iter().enumerate() {
        if *token != "public" {
            continue;
        }
        let mut rest = tokens[i + 1..].iter();
        for next in rest.by_ref() {
            match *next {
                "final" | "abstract" | "strictfp" => continue,
                "class" => return rest.next().map(|name| (*name).to_owned()),
                _ => break,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn java() -> JavaToolchain {
        JavaToolchain::new(Config::default().toolchains.java)
    }

    #[test]
    fn public_class_detection() {
        assert_eq!(public_class_name("public class Solution { }").as_deref(), Some("Solution"));
        assert_eq!(public_class_name("public final class App{}").as_deref(), Some("App"));
        assert_eq!(
            public_class_name("import java.util.*;\npublic static void x() {}\npublic class Late {}").as_deref(),
            Some("Late")
        );
        assert_eq!(public_class_name("class Main { public static void main() {} }"), None);
    }

    #[test]
    fn package_declaration_detection() {
        assert_eq!(package_name("package foo;\npublic class Main {}").as_deref(), Some("foo"));
        assert_eq!(
            package_name("// header\n/* licence\n * text */\npackage com.example.app ;\nclass A {}").as_deref(),
            Some("com.example.app")
        );
        assert_eq!(package_name("/* c */ package a.b;").as_deref(), Some("a.b"));
        assert_eq!(package_name("import java.util.*;\npublic class Main {}"), None);
        assert_eq!(package_name("public class packages {}"), None);
        assert_eq!(package_name("// package foo;\nclass Main {}"), None);
    }

    #[test]
    fn packaged_sources_are_rejected() {
        let error = java().check_source("package foo;\npublic class Main {}").unwrap_err();
        assert!(error.contains("package foo"), "{error}");
        assert!(java().check_source("public class Main {}").is_ok());
    }

    #[test]
    fn source_name_follows_public_class() {
        assert_eq!(java().source_name("public class Hello {}"), "Hello.java");
        assert_eq!(java().source_name("class Anything {}"), "Main.java");
    }

    #[test]
    fn compile_command_writes_to_class_dir() {
        let command = java().compile_command(Path::new("/work"), "Main.java");
        assert_eq!(command.program, "javac");
        assert!(command.args.ends_with(&["-d".to_owned(), "classes".to_owned(), "Main.java".to_owned()]));
    }

    #[test]
    fn run_command_expands_memory_and_class() {
        let command = java().run_command(Path::new("/work/artifact"), "public class Hello {}", 256);
        assert_eq!(command.program, "java");
        assert!(command.args.contains(&"-Xmx256m".to_owned()));
        assert_eq!(command.args.last().map(String::as_str), Some("Hello"));
        let cp = command.args.iter().position(|a| a == "-cp").unwrap();
        assert_eq!(command.args[cp + 1], "/work/artifact");
    }

    #[test]
    fn artifact_files_collects_class_files() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(java().artifact_files(dir.path()).is_err());

        let classes = dir.path().join(CLASS_DIR);
        std::fs::create_dir(&classes).unwrap();
        std::fs::write(classes.join("Main.class"), b"").unwrap();
        std::fs::write(classes.join("Main$Node.class"), b"").unwrap();
        std::fs::write(classes.join("notes.txt"), b"").unwrap();

        let files = java().artifact_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() == "class"));
    }
}
