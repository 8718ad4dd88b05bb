//! Supervised Process Runner Integration Tests
//!
//! Real `sh` children under the watchdog: idle kill, overall timeout,
//! heavy output and the join barrier.
#![cfg(unix)]


use integration_harness::sh;
use plugind_runtime::{CapturedOutput, RuntimeError, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;

fn supervisor(overall: Duration, idle: Duration) -> Supervisor {
    Supervisor::new(SupervisorConfig {
        overall_timeout: overall,
        idle_timeout: idle,
        poll_interval: Duration::from_millis(100),
        max_captured_bytes: 64 * 1024,
        drain_grace: Duration::from_millis(500),
    })
}

/// Test: a child that goes quiet is killed by the watchdog
#[tokio::test]
async fn test_idle_child_is_killed() {
    let supervisor = supervisor(Duration::from_secs(30), Duration::from_secs(1));
    let started = std::time::Instant::now();

    // exec keeps the shell's pid, so `$$` names the process being watched
    let err = supervisor
        .run(sh("echo pid=$$ >&2; exec sleep 1000"), "installing acme/slow:1.0.0")
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::IdleTimeout { .. }), "{err:?}");
    // idle limit + one poll period, with slack for a loaded machine
    assert!(started.elapsed() < Duration::from_secs(5));

    let output = err.output().unwrap();
    assert!(output.contains("killed after 1s without output"));

    let pid = output
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .unwrap()
        .trim()
        .to_string();
    let alive = std::process::Command::new("kill")
        .args(["-0", &pid])
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(!alive.success(), "child {pid} survived the idle kill");
}

/// Test: a zero poll period does not disable the watchdog
#[tokio::test]
async fn test_zero_poll_interval_keeps_watchdog() {
    let supervisor = Supervisor::new(SupervisorConfig {
        overall_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_millis(500),
        poll_interval: Duration::ZERO,
        max_captured_bytes: 64 * 1024,
        drain_grace: Duration::from_millis(500),
    });

    let err = supervisor
        .run(sh("echo x >&2; exec sleep 100"), "installing acme/zero:1.0.0")
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::IdleTimeout { .. }), "{err:?}");
}

/// Test: steady output does not save a child from the overall deadline
#[tokio::test]
async fn test_overall_timeout_beats_activity() {
    let supervisor = supervisor(Duration::from_secs(1), Duration::from_secs(10));

    let err = supervisor
        .run(
            sh("while :; do echo tick; echo tock >&2; sleep 0.1; done"),
            "installing acme/chatty:1.0.0",
        )
        .await
        .unwrap_err();

    match err {
        RuntimeError::Timeout { after, output, .. } => {
            assert_eq!(after, Duration::from_secs(1));
            assert!(output.contains("tock"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

/// Test: megabytes on both streams are drained and the capture keeps the tail
#[tokio::test]
async fn test_heavy_output_keeps_tail() {
    let supervisor = supervisor(Duration::from_secs(60), Duration::from_secs(10));
    let capture = Arc::new(CapturedOutput::new(1024));

    // Far past the pipe buffer on each stream; a stalled reader deadlocks the child
    let script = "head -c 4000000 /dev/zero; \
                  head -c 4000000 /dev/zero >&2; \
                  head -c 4000000 /dev/zero; \
                  echo done-marker >&2";
    let run = tokio::time::timeout(
        Duration::from_secs(30),
        supervisor.run_capturing(sh(script), "installing acme/noisy:1.0.0", capture.clone()),
    )
    .await
    .expect("child blocked on a full pipe")
    .unwrap();

    assert!(run.status.success());
    assert!(capture.len() <= 1024);
    assert!(capture.dropped() >= 4_000_000 - 1024);
    assert!(run.output.ends_with("done-marker\n"));
}

/// Test: no reader writes into the capture after the run returns
#[tokio::test]
async fn test_join_barrier() {
    let supervisor = supervisor(Duration::from_secs(30), Duration::from_secs(1));
    let capture = Arc::new(CapturedOutput::new(64 * 1024));

    let _ = supervisor
        .run_capturing(
            sh("echo first >&2; exec sleep 1000"),
            "installing acme/barrier:1.0.0",
            capture.clone(),
        )
        .await;

    assert_eq!(Arc::strong_count(&capture), 1);
    let len = capture.len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(capture.len(), len);
}

/// Test: a failing installer reports its exit status and stderr
#[tokio::test]
async fn test_failure_carries_diagnostics() {
    let supervisor = supervisor(Duration::from_secs(30), Duration::from_secs(10));

    let err = supervisor
        .run(
            sh("echo 'ERROR: No matching distribution found for nope' >&2; exit 1"),
            "installing acme/broken:1.0.0",
        )
        .await
        .unwrap_err();

    match err {
        RuntimeError::ProcessFailed { label, output, .. } => {
            assert_eq!(label, "installing acme/broken:1.0.0");
            assert!(output.contains("No matching distribution"));
        }
        other => panic!("expected process failure, got {other:?}"),
    }
}
