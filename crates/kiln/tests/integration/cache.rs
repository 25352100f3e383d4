use kiln::{CompilationRequest, Language};

use super::{fixture_source, test_runner};

#[tokio::test]
async fn test_second_submission_hits_cache() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());
    let source = fixture_source("hello.cpp");

    let first = runner
        .compile_and_run(CompilationRequest::new(source.clone(), Language::Cpp))
        .await;
    assert!(first.success);
    assert!(!first.metrics.cached);

    let second = runner
        .compile_and_run(CompilationRequest::new(source, Language::Cpp))
        .await;
    assert!(second.success);
    assert!(second.metrics.cached);
    assert_eq!(second.stdout, first.stdout);
    assert!(second.metrics.compilation_time < first.metrics.compilation_time);

    let stats = runner.cache().stats();
    assert_eq!(stats.entries, 1);
    assert!(stats.hits >= 1);
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let root = tempfile::TempDir::new().unwrap();
    let source = fixture_source("hello.cpp");

    let runner = test_runner(root.path());
    let first = runner
        .compile_and_run(CompilationRequest::new(source.clone(), Language::Cpp))
        .await;
    assert!(first.success);
    drop(runner);

    let runner = test_runner(root.path());
    assert_eq!(runner.cache().stats().entries, 1);
    let second = runner
        .compile_and_run(CompilationRequest::new(source, Language::Cpp))
        .await;
    assert!(second.metrics.cached);
}

#[tokio::test]
async fn test_same_source_in_other_language_is_a_miss() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());
    let source = fixture_source("exit_code.c");

    runner.compile(&source, Language::C, None).await.unwrap();
    let compiled = runner.compile(&source, Language::Cpp, None).await.unwrap();
    assert!(!compiled.cached);
    assert_eq!(runner.cache().stats().entries, 2);
}
