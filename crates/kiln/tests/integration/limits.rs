use std::time::{Duration, Instant};

use kiln::{CompilationRequest, ErrorKind, Language, ResourceLimits, RunError};

use super::{fixture_source, test_runner};

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    // Compile first so the timing below covers only the run
    let source = fixture_source("infinite_loop.cpp");
    runner.compile(&source, Language::Cpp, None).await.unwrap();

    let limits = ResourceLimits::empty().with_execution_timeout(1.0);
    let started = Instant::now();
    let result = runner
        .compile_and_run(CompilationRequest::new(source, Language::Cpp).with_limits(limits))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.error, Some(RunError::ExecutionTimeout { limit_secs: 1.0 }));
    // Limit, one poll interval and the kill grace, plus scheduling slack
    assert!(elapsed < Duration::from_millis(1000 + 100 + 200 + 700), "took {elapsed:?}");
}

#[tokio::test]
async fn test_fork_fixture_compiles_as_c11() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let compiled = runner.compile(&fixture_source("fork_loop.c"), Language::C, None).await;
    assert!(compiled.is_ok(), "fork_loop.c failed to compile: {:?}", compiled.err());
}

#[tokio::test]
async fn test_timeout_leaves_no_orphans() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let limits = ResourceLimits::empty().with_execution_timeout(1.0);
    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("fork_loop.c"), Language::C).with_limits(limits))
        .await;
    assert_eq!(result.error.as_ref().map(RunError::kind), Some(ErrorKind::ExecutionTimeout));

    // The forked child printed its pid before spinning
    let pid: u32 = result.stdout.trim().parse().expect("child pid in stdout");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap_or_default();
    let alive = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state != "Z" && state != "X");
    assert!(!alive, "forked child {pid} survived the timeout");
}

#[tokio::test]
async fn test_memory_limit_is_enforced() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let limits = ResourceLimits::empty()
        .with_memory_limit_mb(64)
        .with_execution_timeout(10.0);
    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("memory_hog.cpp"), Language::Cpp).with_limits(limits))
        .await;

    assert!(!result.success);
    match result.error {
        Some(RunError::MemoryLimitExceeded { limit_mb, peak_bytes }) => {
            assert_eq!(limit_mb, 64);
            assert!(peak_bytes > 64 * 1024 * 1024);
        }
        other => panic!("expected memory limit failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_output_is_capped() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let source = r#"#include <stdio.h>
int main(void) {
    for (int i = 0; i < 100000; i++) {
        printf("line %d\n", i);
    }
    return 0;
}
"#;
    let limits = ResourceLimits {
        max_output_bytes: Some(1024),
        ..ResourceLimits::empty()
    };
    let result = runner
        .compile_and_run(CompilationRequest::new(source, Language::C).with_limits(limits))
        .await;

    assert!(result.output_truncated);
    assert!(result.stdout.len() <= 1024);
    assert!(result.stdout.starts_with("line 0\n"));
}
