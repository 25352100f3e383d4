//! Human-readable descriptions of compiler and runtime failures

use std::path::Path;

use nix::sys::signal::Signal;

/// Known compiler diagnostics, matched against the first error line
const COMPILE_PATTERNS: &[(&str, &str)] = &[
    ("expected ';'", "Missing semicolon"),
    ("';' expected", "Missing semicolon"),
    ("was not declared in this scope", "Use of an undeclared name"),
    ("undeclared (first use in this function)", "Use of an undeclared name"),
    ("cannot find symbol", "Use of an undeclared name"),
    ("is public, should be declared in a file named", "Public class name does not match the file name"),
    ("incompatible types", "Incompatible types"),
    ("cannot convert", "Incompatible types"),
    ("invalid conversion", "Incompatible types"),
    ("missing return statement", "Missing return statement"),
    ("no matching function for call", "No function matches this call"),
    ("undefined reference to", "Undefined reference at link time"),
    ("reached end of file while parsing", "Unexpected end of file, check braces"),
    ("expected '}'", "Unbalanced braces"),
    ("unclosed string literal", "Unterminated string literal"),
    ("missing terminating", "Unterminated string literal"),
    ("might not have been initialized", "Variable used before initialization"),
    ("unreported exception", "Checked exception is not caught or declared"),
];

/// Known runtime fault signatures, matched anywhere in stderr
const RUNTIME_PATTERNS: &[(&str, &str)] = &[
    ("Segmentation fault", "Segmentation fault: invalid memory access"),
    ("std::bad_alloc", "Out of memory"),
    ("java.lang.OutOfMemoryError", "Out of memory"),
    ("std::out_of_range", "Index out of range"),
    ("java.lang.ArrayIndexOutOfBoundsException", "Array index out of bounds"),
    ("java.lang.StringIndexOutOfBoundsException", "String index out of bounds"),
    ("java.lang.IndexOutOfBoundsException", "Index out of bounds"),
    ("java.lang.NullPointerException", "Null reference used"),
    ("java.lang.ArithmeticException", "Arithmetic error, possibly division by zero"),
    ("java.lang.StackOverflowError", "Stack overflow, recursion too deep"),
    ("java.lang.NumberFormatException", "Invalid number format"),
    ("java.util.InputMismatchException", "Input does not match the expected type"),
    ("java.util.NoSuchElementException", "Program read more input than was provided"),
    ("java.lang.ClassCastException", "Invalid type cast"),
    ("stack smashing detected", "Stack buffer overflow detected"),
    ("double free", "Memory corruption detected"),
    ("free(): invalid pointer", "Memory corruption detected"),
    ("Floating point exception", "Floating point exception, possibly division by zero"),
    ("terminate called", "Uncaught exception"),
];

const OUT_OF_MEMORY_MARKERS: &[&str] = &["std::bad_alloc", "java.lang.OutOfMemoryError"];

/// Turn raw compiler output into a one-line message.
///
/// Workspace paths are stripped first. The first error line that matches a
/// known pattern is reported with its line number; otherwise the cleaned
/// compiler text is returned as is.
pub fn format_compile_error(raw: &str, workspace: &Path, exit_code: Option<i32>) -> String {
    let cleaned = strip_workspace(raw, workspace);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return match exit_code {
            Some(code) => format!("Compilation failed with exit code {code}"),
            None => "Compilation failed".to_owned(),
        };
    }

    let first_error = cleaned.lines().find(|line| line.contains("error"));
    if let Some(line) = first_error {
        for (pattern, label) in COMPILE_PATTERNS {
            if line.contains(pattern) {
                let detail = error_detail(line);
                return match source_line(line) {
                    Some(number) => format!("{label} (line {number}): {detail}"),
                    None => format!("{label}: {detail}"),
                };
            }
        }
    }

    cleaned.to_owned()
}

/// Describe a failed run from its stderr, exit code and terminating signal
pub fn describe_runtime_error(stderr: &str, exit_code: Option<i32>, signal: Option<i32>) -> String {
    if let Some((_, description)) = RUNTIME_PATTERNS.iter().find(|(pattern, _)| stderr.contains(pattern)) {
        return (*description).to_owned();
    }

    if let Some(signal) = signal {
        let description = match Signal::try_from(signal) {
            Ok(Signal::SIGSEGV) => "Segmentation fault: invalid memory access".to_owned(),
            Ok(Signal::SIGFPE) => "Floating point exception, possibly division by zero".to_owned(),
            Ok(Signal::SIGABRT) => "Program aborted".to_owned(),
            Ok(Signal::SIGBUS) => "Bus error: misaligned or invalid memory access".to_owned(),
            Ok(Signal::SIGKILL) => "Program was killed".to_owned(),
            Ok(other) => format!("Program terminated by {other}"),
            Err(_) => format!("Program terminated by signal {signal}"),
        };
        return description;
    }

    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_owned();
    }
    match exit_code {
        Some(code) => format!("Program exited with code {code}"),
        None => "Program terminated abnormally".to_owned(),
    }
}

/// Whether stderr shows the program ran out of memory on its own
pub fn is_out_of_memory(stderr: &str) -> bool {
    OUT_OF_MEMORY_MARKERS.iter().any(|marker| stderr.contains(marker))
}

fn strip_workspace(raw: &str, workspace: &Path) -> String {
    let prefix = format!("{}/", workspace.display());
    raw.replace(&prefix, "")
}

/// Line number from `file:line:col: error: ...` or `File.java:line: error: ...`
fn source_line(line: &str) -> Option<u32> {
    line.split(':').nth(1)?.trim().parse().ok()
}

/// Text after the `error:` marker
fn error_detail(line: &str) -> &str {
    line.split_once("error:")
        .map(|(_, detail)| detail.trim())
        .unwrap_or(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_surfaces_known_pattern() {
        let workspace = Path::new("/tmp/kiln-abc");
        let raw = "/tmp/kiln-abc/main.cpp: In function 'int main()':\n\
                   /tmp/kiln-abc/main.cpp:4:5: error: expected ';' before 'return'\n\
                   4 |     return 0;\n";
        let message = format_compile_error(raw, workspace, Some(1));
        assert_eq!(message, "Missing semicolon (line 4): expected ';' before 'return'");
        assert!(!message.contains("/tmp/kiln-abc"));
    }

    #[test]
    fn compile_error_java_pattern() {
        let workspace = Path::new("/work/ws");
        let raw = "/work/ws/Main.java:3: error: cannot find symbol\n        foo();\n        ^\n1 error\n";
        let message = format_compile_error(raw, workspace, Some(1));
        assert_eq!(message, "Use of an undeclared name (line 3): cannot find symbol");
    }

    #[test]
    fn compile_error_falls_back_to_cleaned_text() {
        let workspace = Path::new("/w");
        let raw = "/w/main.c:1:1: error: something exotic\n";
        assert_eq!(
            format_compile_error(raw, workspace, Some(1)),
            "main.c:1:1: error: something exotic"
        );
        assert_eq!(
            format_compile_error("", workspace, Some(4)),
            "Compilation failed with exit code 4"
        );
    }

    #[test]
    fn runtime_error_table() {
        assert_eq!(
            describe_runtime_error(
                "Exception in thread \"main\" java.lang.ArithmeticException: / by zero",
                Some(1),
                None
            ),
            "Arithmetic error, possibly division by zero"
        );
        assert_eq!(
            describe_runtime_error("terminate called after throwing an instance of 'std::bad_alloc'", None, Some(6)),
            "Out of memory"
        );
    }

    #[test]
    fn runtime_error_from_signal() {
        assert_eq!(
            describe_runtime_error("", None, Some(11)),
            "Segmentation fault: invalid memory access"
        );
        assert_eq!(describe_runtime_error("", None, Some(6)), "Program aborted");
    }

    #[test]
    fn runtime_error_falls_back_to_stderr() {
        assert_eq!(describe_runtime_error("  custom failure \n", Some(2), None), "custom failure");
        assert_eq!(describe_runtime_error("", Some(3), None), "Program exited with code 3");
    }

    #[test]
    fn out_of_memory_markers() {
        assert!(is_out_of_memory("Exception in thread \"main\" java.lang.OutOfMemoryError: Java heap space"));
        assert!(!is_out_of_memory("java.lang.NullPointerException"));
    }
}
