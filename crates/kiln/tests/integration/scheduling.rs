use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use kiln::{CompilationRequest, Language};

use super::test_runner;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_respect_pool_size() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());
    let pool_size = runner.scheduler().stats().pool_size;
    assert_eq!(pool_size, 2);

    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let runner = runner.clone();
        let peak = peak.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::Acquire) {
                peak.fetch_max(runner.scheduler().active_workers(), Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    // Distinct sources so every request compiles
    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let runner = runner.clone();
            let source = format!("#include <stdio.h>\nint main(void) {{ printf(\"{i}\\n\"); return 0; }}\n");
            tokio::spawn(async move { runner.compile_and_run(CompilationRequest::new(source, Language::C)).await })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let result = task.await.unwrap();
        assert!(result.success, "request {i} failed: {:?}", result.error);
        assert_eq!(result.stdout.trim(), i.to_string());
    }
    done.store(true, Ordering::Release);
    sampler.await.unwrap();

    let peak = peak.load(Ordering::Acquire);
    assert!(peak >= 1);
    assert!(peak <= pool_size, "peak {peak} exceeded pool size {pool_size}");
    assert_eq!(runner.scheduler().active_workers(), 0);
}
