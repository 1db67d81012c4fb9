//! Hostile programs: runaway loops, stray children, resource abuse

use coderun_common::{ExecutionRequest, Outcome, SessionEvent, StreamKind};
use coderun_sandbox::{SandboxError, SessionManager};
use coderun_tests::{
    collect_events, process_alive, require_toolchain, test_config, test_pipeline, wait_until,
    workspace_entries,
};
use tokio_stream::StreamExt;
use std::time::{Duration, Instant};

fn recorded_pid(output: &str) -> u32 {
    output
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
        .expect("program did not report a pid")
}

#[tokio::test]
async fn test_timeout_leaves_no_process_behind() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = test_pipeline(test_config(root.path()));

    let started = Instant::now();
    let result = pipeline
        .execute(
            ExecutionRequest::new("sh", "sleep 300 &\necho pid=$!\nwhile :; do :; done\n")
                .with_timeout(1),
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::TimedOut);
    assert!(result.timed_out);
    assert_eq!(result.exit_code, -1);
    assert!(started.elapsed() < Duration::from_secs(4));

    let pid = recorded_pid(&result.stdout);
    assert!(wait_until(Duration::from_secs(2), || !process_alive(pid)).await);
    assert_eq!(workspace_entries(root.path()), 0);
}

#[tokio::test]
async fn test_background_children_are_reaped_after_exit() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = test_pipeline(test_config(root.path()));

    let started = Instant::now();
    let result = pipeline
        .execute(ExecutionRequest::new("sh", "sleep 300 &\necho pid=$!\nexit 0\n"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.exit_code, 0);
    // The orphan holds the pipes open; it must not hold up the result
    assert!(started.elapsed() < Duration::from_secs(4));
    let pid = recorded_pid(&result.stdout);
    assert!(wait_until(Duration::from_secs(2), || !process_alive(pid)).await);
}

#[tokio::test]
async fn test_dropped_execution_kills_program() {
    let root = tempfile::tempdir().unwrap();
    let pid_file = root.path().join("pid");
    let mut config = test_config(&root.path().join("workspaces"));
    config.engine.max_run_timeout_secs = 60;
    let pipeline = test_pipeline(config);

    let source = format!("echo $$ > {}\nsleep 300\n", pid_file.display());
    let execution = pipeline.execute(ExecutionRequest::new("sh", source).with_timeout(60));
    let _ = tokio::time::timeout(Duration::from_millis(500), execution).await;

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || !process_alive(pid)).await);
    assert_eq!(workspace_entries(&root.path().join("workspaces")), 0);
}

#[tokio::test]
async fn test_cpu_limit_stops_busy_loop() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sandbox.run_limits.cpu_time_secs = Some(1);
    config.engine.max_run_timeout_secs = 10;
    let pipeline = test_pipeline(config);

    let result = pipeline
        .execute(ExecutionRequest::new("sh", "while :; do :; done").with_timeout(10))
        .await
        .unwrap();

    // SIGXCPU (24) or the hard-limit SIGKILL (9), well before the deadline
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(
        result.exit_code == 128 + 24 || result.exit_code == 128 + 9,
        "exit code {}",
        result.exit_code
    );
}

#[tokio::test]
async fn test_file_size_limit() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sandbox.run_limits.max_file_size_bytes = Some(64 * 1024);
    let pipeline = test_pipeline(config);

    let result = pipeline
        .execute(ExecutionRequest::new(
            "sh",
            "trap '' XFSZ\nhead -c 1048576 /dev/zero > big.bin\necho status=$?\nwc -c < big.bin\n",
        ))
        .await
        .unwrap();

    assert!(result.stdout.contains("status=1"), "{:?}", result);
    assert!(result.stdout.trim_end().ends_with("65536"));
}

#[tokio::test]
async fn test_memory_cap_from_request() {
    require_toolchain!("python3");
    let root = tempfile::tempdir().unwrap();
    let pipeline = test_pipeline(test_config(root.path()));

    let result = pipeline
        .execute(
            ExecutionRequest::new("python", "data = bytearray(1024 ** 3)\nprint(len(data))\n")
                .with_memory_limit(128 * 1024 * 1024)
                .with_timeout(10),
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("MemoryError"));
}

#[tokio::test]
async fn test_host_environment_is_not_visible() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = test_pipeline(test_config(root.path()));

    let result = pipeline
        .execute(ExecutionRequest::new(
            "sh",
            "echo \"home=$HOME\"; echo \"cargo=${CARGO_HOME:-}${RUST_LOG:-}\"; pwd",
        ))
        .await
        .unwrap();

    let lines: Vec<&str> = result.stdout.lines().collect();
    assert_eq!(lines[1], "cargo=");
    // HOME points into the throwaway workspace
    assert_eq!(lines[0].strip_prefix("home=").unwrap(), lines[2]);
    assert!(lines[2].starts_with(root.path().to_str().unwrap()));
}

#[tokio::test]
async fn test_program_gets_its_own_network_namespace() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.sandbox.isolate_network = true;
    let pipeline = test_pipeline(config);

    let host = std::fs::read_link("/proc/self/ns/net").unwrap();
    let result = match pipeline
        .execute(ExecutionRequest::new("sh", "readlink /proc/self/ns/net"))
        .await
    {
        Ok(result) => result,
        // Hosts without unprivileged user namespaces refuse the unshare
        // (EPERM, EINVAL or ENOSPC)
        Err(SandboxError::Spawn { ref source, .. })
            if matches!(source.raw_os_error(), Some(1 | 22 | 28)) =>
        {
            eprintln!("skipping: user namespaces unavailable ({})", source);
            return;
        }
        Err(e) => panic!("execution failed: {}", e),
    };

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.exit_code, 0, "{:?}", result);
    let inside = result.stdout.trim();
    assert!(inside.starts_with("net:["), "{:?}", inside);
    assert_ne!(inside, host.to_str().unwrap());
}

#[tokio::test]
async fn test_closing_session_kills_background_children() {
    let root = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(test_pipeline(test_config(root.path())));

    let id = manager
        .open("sh", "sleep 300 &\necho pid=$!\nwait\n")
        .await
        .unwrap();
    let mut events = manager.receive_output(id).unwrap();

    let mut stdout = String::new();
    let announced = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            if let SessionEvent::Output {
                stream: StreamKind::Stdout,
                data,
            } = event
            {
                stdout.push_str(&data);
                if stdout.contains('\n') {
                    break;
                }
            }
        }
    })
    .await;
    assert!(announced.is_ok(), "session never reported its child");
    let pid = recorded_pid(&stdout);
    assert!(process_alive(pid));

    manager.close(id).await.unwrap();
    let transcript = collect_events(events, Duration::from_secs(5)).await;
    assert_eq!(
        transcript.terminal,
        Some(SessionEvent::Closed {
            reason: coderun_common::CloseReason::Requested
        })
    );
    assert!(wait_until(Duration::from_secs(2), || !process_alive(pid)).await);
    assert_eq!(workspace_entries(root.path()), 0);
}
