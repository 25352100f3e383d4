use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A source language the sandbox knows how to build and run.
///
/// The set is closed on purpose: every variant has a matching
/// [`Toolchain`](crate::toolchain::Toolchain) implementation, and adding a
/// language means adding one variant and one toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    C,
    Java,
}

impl Language {
    /// Every supported language, in display order
    pub const ALL: [Language; 3] = [Language::Cpp, Language::C, Language::Java];

    /// Stable identifier used in configuration and on the wire
    pub fn id(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Java => "java",
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Language::Cpp => "C++ 17 (GCC)",
            Language::C => "C 11 (GCC)",
            Language::Java => "Java (OpenJDK)",
        }
    }

    /// Whether the language runs on a managed runtime rather than as a native binary
    pub fn is_managed(&self) -> bool {
        matches!(self, Language::Java)
    }

    /// Console-input call patterns used by the interactivity heuristic
    pub fn input_patterns(&self) -> &'static [&'static str] {
        match self {
            Language::Cpp => &[
                "cin >>",
                "cin>>",
                "std::cin",
                "getline(",
                "scanf(",
                "getchar(",
                "fgets(",
            ],
            Language::C => &["scanf(", "getchar(", "fgets(", "getline(", "fscanf(stdin", "read(0"],
            Language::Java => &[
                "new Scanner(System.in",
                "System.in.read",
                "new InputStreamReader(System.in",
                "System.console()",
                ".readLine()",
                ".nextLine()",
                ".nextInt()",
            ],
        }
    }

    /// Starter program handed out by `get_template`
    pub fn template(&self) -> &'static str {
        match self {
            Language::Cpp => CPP_TEMPLATE,
            Language::C => C_TEMPLATE,
            Language::Java => JAVA_TEMPLATE,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Language {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" | "cpp17" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "java" => Ok(Language::Java),
            other => Err(ConfigError::LanguageNotFound(other.to_owned())),
        }
    }
}

const CPP_TEMPLATE: &str = r#"#include <iostream>
#include <string>

int main() {
    std::string name;
    std::cout << "Enter your name: " << std::flush;
    std::getline(std::cin, name);
    std::cout << "Hello, " << name << "!" << std::endl;
    return 0;
}
"#;

const C_TEMPLATE: &str = r#"#include <stdio.h>

int main(void) {
    printf("Hello, World!\n");
    return 0;
}
"#;

const JAVA_TEMPLATE: &str = r#"import java.util.Scanner;

public class Main {
    public static void main(String[] args) {
        Scanner scanner = new Scanner(System.in);
        System.out.print("Enter your name: ");
        System.out.flush();
        String name = scanner.nextLine();
        System.out.println("Hello, " + name + "!");
    }
}
"#;

/// Settings for a natively compiled language (C, C++)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    /// Compiler executable (resolved through PATH)
    pub compiler: String,

    /// Flags placed before the source file
    #[serde(default)]
    pub flags: Vec<String>,

    /// Flags placed after the source file (libraries)
    #[serde(default)]
    pub link_flags: Vec<String>,

    /// Source file name inside the workspace
    pub source_name: String,

    /// Name of the produced executable
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
}

fn default_binary_name() -> String {
    "main".to_owned()
}

/// Settings for the JVM toolchain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaConfig {
    /// Compiler executable
    #[serde(default = "default_javac")]
    pub javac: String,

    /// Runtime launcher
    #[serde(default = "default_java")]
    pub java: String,

    #[serde(default)]
    pub javac_flags: Vec<String>,

    /// JVM flags. `{memory_mb}` expands to the execution memory ceiling.
    #[serde(default)]
    pub jvm_flags: Vec<String>,

    /// Class launched when the source declares no public class
    #[serde(default = "default_main_class")]
    pub main_class: String,
}

fn default_javac() -> String {
    "javac".to_owned()
}

fn default_java() -> String {
    "java".to_owned()
}

fn default_main_class() -> String {
    "Main".to_owned()
}

/// Per-language toolchain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainsConfig {
    pub cpp: NativeConfig,
    pub c: NativeConfig,
    pub java: JavaConfig,
}
