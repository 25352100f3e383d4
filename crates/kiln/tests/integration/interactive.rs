use kiln::{CompilationRequest, ErrorKind, Language, SessionError};

use super::{drain_until, fixture_source, test_runner, test_service};

#[tokio::test]
async fn test_input_reading_program_starts_session() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("echo.cpp"), Language::Cpp))
        .await;
    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert!(result.interactive);
    assert!(result.stdout.is_empty());
    let session_id = result.session_id.expect("session id");

    let prompt = drain_until(&runner, session_id, |o| o.stdout.contains("Say something")).await;
    assert_eq!(prompt.stdout, "Say something: ");
    assert!(prompt.waiting_for_input);

    runner.sessions().send(session_id, "X").await.unwrap();
    // The program exits after one line; the final drain ends the session
    let reply = drain_until(&runner, session_id, |o| o.session_ended).await;
    assert!(reply.stdout.contains("You said: X"), "stdout: {:?}", reply.stdout);
    assert!(reply.session_ended);
    assert_eq!(reply.exit_code, Some(0));
    assert!(runner.sessions().is_empty());
}

#[tokio::test]
async fn test_input_after_exit_is_rejected() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .start_session(fixture_source("hello.cpp"), Language::Cpp, None)
        .await;
    let session_id = result.session_id.expect("session id");

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while runner.sessions().state(session_id) != Some(kiln::SessionState::Ended)
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    let error = runner.sessions().send(session_id, "late").await.unwrap_err();
    assert!(matches!(error, SessionError::ProcessNotRunning(_)));
    runner.sessions().end(session_id).await;
}

#[tokio::test]
async fn test_service_session_round_trip() {
    let root = tempfile::TempDir::new().unwrap();
    let service = test_service(root.path());

    let submitted = service.submit(&fixture_source("echo.cpp"), "cpp", None, None).await;
    assert!(submitted.success);
    assert!(submitted.interactive);
    let session_id = submitted.session_id.expect("session id").to_string();

    assert!(service.send_input(&session_id, "hello there").await.success);

    let mut output = String::new();
    for _ in 0..200 {
        let response = service.get_output(&session_id).await;
        assert!(response.success);
        output.push_str(&response.output);
        if response.session_ended {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    assert!(output.contains("You said: hello there"), "output: {output:?}");

    // Drained to the end, so the session is gone
    let gone = service.get_output(&session_id).await;
    assert!(!gone.success);
    assert_eq!(gone.failure.map(|f| f.error_kind), Some(ErrorKind::InvalidSession));
}

#[tokio::test]
async fn test_end_session_twice_removes_workspace_once() {
    let root = tempfile::TempDir::new().unwrap();
    let service = test_service(root.path());

    let submitted = service.start_session(&fixture_source("echo.cpp"), "cpp").await;
    let session_id = submitted.session_id.expect("session id").to_string();
    assert_eq!(std::fs::read_dir(root.path().join("work")).unwrap().count(), 1);

    assert!(service.end_session(&session_id).await.success);
    assert!(service.end_session(&session_id).await.success);
    assert_eq!(std::fs::read_dir(root.path().join("work")).unwrap().count(), 0);
    assert_eq!(service.stats().live_sessions, 0);
}

#[tokio::test]
#[ignore = "requires javac"]
async fn test_java_session() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner(root.path());

    let result = runner
        .compile_and_run(CompilationRequest::new(fixture_source("Greeter.java"), Language::Java))
        .await;
    assert!(result.interactive, "unexpected result: {:?}", result.error);
    let session_id = result.session_id.expect("session id");

    let prompt = drain_until(&runner, session_id, |o| o.stdout.contains("Enter your name")).await;
    assert!(prompt.waiting_for_input);

    runner.sessions().send(session_id, "Ada").await.unwrap();
    let reply = drain_until(&runner, session_id, |o| o.stdout.contains("Hello, Ada!")).await;
    assert!(reply.stdout.contains("Hello, Ada!"));
    runner.sessions().end(session_id).await;
}
