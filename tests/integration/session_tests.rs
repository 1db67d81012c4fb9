//! Interactive sessions driven through the manager

use assert_matches::assert_matches;
use coderun_common::{CloseReason, SessionEvent, SessionState};
use coderun_sandbox::{SandboxError, SessionManager};
use coderun_tests::{
    collect_events, test_config, test_pipeline, wait_until, with_shell_syntax_check,
    workspace_entries,
};
use std::time::Duration;

const FINISH: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_two_lines_in_one_sum_out() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));

    let id = manager
        .open("sh", "read a\nread b\necho $((a + b))\n")
        .await
        .unwrap();
    assert_eq!(manager.state(id).unwrap(), SessionState::Running);
    let events = manager.receive_output(id).unwrap();

    manager.send_input(id, "5").await.unwrap();
    manager.send_input(id, "3").await.unwrap();

    let transcript = collect_events(events, FINISH).await;
    assert_eq!(transcript.stdout, "8\n");
    assert_eq!(transcript.terminal, Some(SessionEvent::Exited { exit_code: 0 }));
    assert_eq!(manager.state(id).unwrap(), SessionState::Closed);
    assert!(wait_until(FINISH, || workspace_entries(root.path()) == 0).await);
}

#[tokio::test]
async fn test_output_arrives_before_input_ends() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));
    let id = manager
        .open("sh", "while read line; do echo \"echo: $line\"; done\n")
        .await
        .unwrap();
    let mut events = manager.receive_output(id).unwrap();

    manager.send_input(id, "hello").await.unwrap();
    let first = tokio::time::timeout(FINISH, tokio_stream::StreamExt::next(&mut events))
        .await
        .unwrap();
    assert_matches!(first, Some(SessionEvent::Output { ref data, .. }) if data == "echo: hello\n");

    manager.close_input(id).await.unwrap();
    let transcript = collect_events(events, FINISH).await;
    assert_eq!(transcript.terminal, Some(SessionEvent::Exited { exit_code: 0 }));
}

#[tokio::test]
async fn test_input_after_close_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));
    let id = manager.open("sh", "sleep 30\n").await.unwrap();
    let events = manager.receive_output(id).unwrap();

    manager.close(id).await.unwrap();
    let transcript = collect_events(events, FINISH).await;
    assert_eq!(
        transcript.terminal,
        Some(SessionEvent::Closed {
            reason: CloseReason::Requested
        })
    );

    let err = manager.send_input(id, "late").await.unwrap_err();
    assert_matches!(err, SandboxError::InvalidSessionState { state: SessionState::Closed, .. });
    // Closing twice is harmless
    manager.close(id).await.unwrap();
    assert_eq!(workspace_entries(root.path()), 0);
}

#[tokio::test]
async fn test_compile_failure_yields_failed_session() {
    let root = tempfile::tempdir().unwrap();
    let config = with_shell_syntax_check(test_config(root.path()));
    let manager = SessionManager::new(test_pipeline(config));

    let id = manager.open("shell", "if then (\n").await.unwrap();
    assert_eq!(manager.state(id).unwrap(), SessionState::Failed);

    let transcript = collect_events(manager.receive_output(id).unwrap(), FINISH).await;
    assert_matches!(
        transcript.terminal,
        Some(SessionEvent::CompileFailed { ref output, timed_out: false }) if !output.is_empty()
    );
    assert_matches!(
        manager.send_input(id, "x").await,
        Err(SandboxError::InvalidSessionState { .. })
    );
    assert_eq!(workspace_entries(root.path()), 0);
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sessions.idle_timeout = Duration::from_millis(300);
    let manager = SessionManager::new(test_pipeline(config));

    let id = manager.open("sh", "read never\n").await.unwrap();
    let transcript = collect_events(manager.receive_output(id).unwrap(), FINISH).await;
    assert_eq!(
        transcript.terminal,
        Some(SessionEvent::Closed {
            reason: CloseReason::IdleTimeout
        })
    );
    assert_eq!(manager.state(id).unwrap(), SessionState::Closed);
}

#[tokio::test]
async fn test_lifetime_cap_closes_busy_session() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sessions.max_lifetime = Duration::from_millis(500);
    let manager = SessionManager::new(test_pipeline(config));

    // Chatty enough to never look idle
    let id = manager
        .open("sh", "while :; do echo tick; sleep 0.05; done\n")
        .await
        .unwrap();
    let transcript = collect_events(manager.receive_output(id).unwrap(), FINISH).await;
    assert!(transcript.stdout.starts_with("tick\n"));
    assert_eq!(
        transcript.terminal,
        Some(SessionEvent::Closed {
            reason: CloseReason::LifetimeExceeded
        })
    );
}

#[tokio::test]
async fn test_output_stream_has_one_consumer() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));
    let id = manager.open("sh", "sleep 30\n").await.unwrap();

    let _events = manager.receive_output(id).unwrap();
    assert_matches!(
        manager.receive_output(id),
        Err(SandboxError::InvalidSessionState { .. })
    );
    manager.close(id).await.unwrap();
}

#[tokio::test]
async fn test_session_limit_is_enforced() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sessions.max_sessions = 1;
    let manager = SessionManager::new(test_pipeline(config));

    let first = manager.open("sh", "sleep 30\n").await.unwrap();
    assert_matches!(
        manager.open("sh", "sleep 30\n").await,
        Err(SandboxError::ResourceExhausted(_))
    );

    manager.close(first).await.unwrap();
    let second = manager.open("sh", "sleep 30\n").await.unwrap();
    manager.close(second).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));
    let ids = [
        manager.open("sh", "sleep 30\n").await.unwrap(),
        manager.open("sh", "read x\n").await.unwrap(),
    ];
    assert_eq!(manager.list().len(), 2);

    manager.shutdown().await;
    for id in ids {
        assert_eq!(manager.state(id).unwrap(), SessionState::Closed);
    }
    assert_eq!(workspace_entries(root.path()), 0);
}

#[tokio::test]
async fn test_unknown_session() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));
    let id = coderun_common::SessionId::new();
    assert_matches!(manager.state(id), Err(SandboxError::SessionNotFound(_)));
    assert_matches!(manager.close(id).await, Err(SandboxError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_crashed_program_fails_session() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));

    let id = manager.open("sh", "kill -SEGV $$\n").await.unwrap();
    let transcript = collect_events(manager.receive_output(id).unwrap(), FINISH).await;
    assert_eq!(transcript.terminal, Some(SessionEvent::Exited { exit_code: 139 }));
    assert_eq!(manager.state(id).unwrap(), SessionState::Failed);
    assert_eq!(workspace_entries(root.path()), 0);
}

#[tokio::test]
async fn test_input_to_program_that_closed_stdin() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));

    // Nothing holds the read end of the pipe after this
    let id = manager.open("sh", "exec 0<&-\nsleep 30\n").await.unwrap();
    let events = manager.receive_output(id).unwrap();

    let mut rejected = None;
    for _ in 0..50 {
        match manager.send_input(id, "hello").await {
            Ok(()) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => {
                rejected = Some(e);
                break;
            }
        }
    }
    let err = rejected.expect("writes to a closed pipe kept succeeding");
    assert_matches!(
        err,
        SandboxError::InvalidSessionState { state, .. } if state != SessionState::Running
    );
    assert!(err.to_string().contains("exited program"), "{}", err);

    manager.close(id).await.unwrap();
    let transcript = collect_events(events, FINISH).await;
    assert_matches!(transcript.terminal, Some(SessionEvent::Closed { .. }));
}
