use kiln::{CompilationRequest, ErrorKind, Language, RunError, RunMode};

use super::{fixture_source, test_runner};

#[tokio::test]
async fn test_hello_cpp() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("hello.cpp"), Language::Cpp))
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.stdout, "Hello, World!\n");
    assert!(!result.interactive);
    assert!(result.session_id.is_none());
    assert!(result.metrics.total_time > std::time::Duration::ZERO);
    assert!(result.metrics.compilation_time > std::time::Duration::ZERO);
    assert!(!result.metrics.cached);
}

#[tokio::test]
async fn test_c_reads_provided_stdin() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    // Reads input, but provided stdin means a batch run
    let request = CompilationRequest::new(fixture_source("sum.c"), Language::C).with_stdin("2 40\n");
    let result = runner.compile_and_run(request).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert!(!result.interactive);
    assert_eq!(result.stdout.trim(), "42");
}

#[tokio::test]
async fn test_compile_error_is_formatted() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("compile_error.cpp"), Language::Cpp))
        .await;

    assert!(!result.success);
    match result.error {
        Some(RunError::Compilation { message, raw, .. }) => {
            assert!(message.starts_with("Missing semicolon (line"), "message: {message}");
            assert!(!raw.is_empty());
            assert!(!message.contains(&root.path().display().to_string()));
        }
        other => panic!("expected compilation error, got {other:?}"),
    }
    assert!(result.metrics.total_time > std::time::Duration::ZERO);
}

#[tokio::test]
async fn test_runtime_fault_is_described() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("out_of_range.cpp"), Language::Cpp))
        .await;

    assert!(!result.success);
    let error = result.error.expect("expected an error");
    assert_eq!(error.kind(), ErrorKind::RuntimeError);
    assert_eq!(error.to_string(), "Index out of range");
}

#[tokio::test]
async fn test_nonzero_exit_code() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("exit_code.c"), Language::C))
        .await;

    match result.error {
        Some(RunError::Runtime { exit_code, message, .. }) => {
            assert_eq!(exit_code, Some(3));
            assert_eq!(message, "Program exited with code 3");
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_workspaces_are_removed_after_batch_runs() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("hello.cpp"), Language::Cpp))
        .await;
    assert!(result.success);

    let leftovers = std::fs::read_dir(root.path().join("work")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
#[ignore = "requires javac"]
async fn test_hello_java() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let request = CompilationRequest::new(fixture_source("Main.java"), Language::Java).with_mode(RunMode::Batch);
    let result = runner.compile_and_run(request).await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.stdout, "Hello from Java\n");
}
