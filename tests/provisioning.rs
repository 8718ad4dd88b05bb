//! Plugin Runtime Lifecycle Integration Tests
//!
//! Drives `LocalPluginRuntime` through provisioning, installation, serving,
//! restart and reuse against fake interpreters.
#![cfg(unix)]


use integration_harness::{CRASHING_PLUGIN, ECHO_PLUGIN, FakePython, eventually};
use plugind_runtime::{
    InvocationEvent, InvocationRequest, LocalPluginRuntime, LocalRuntimeConfig, PluginIdentity,
    PluginRuntime, PythonProvisioner, RuntimeError, RuntimeRegistry, RuntimeState, Supervisor,
    SupervisorConfig,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn runtime(
    registry: &RuntimeRegistry,
    fake: &FakePython,
    identity: &PluginIdentity,
    working_path: &Path,
) -> LocalPluginRuntime {
    let handle = registry.begin(identity.clone(), working_path).unwrap();
    LocalPluginRuntime::new(
        handle,
        Arc::new(PythonProvisioner::new(&fake.base)),
        Supervisor::new(SupervisorConfig {
            overall_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            ..SupervisorConfig::default()
        }),
        LocalRuntimeConfig {
            health_interval: Duration::from_millis(50),
            restart_backoff: Duration::from_millis(10),
            max_restarts: 2,
            ..LocalRuntimeConfig::default()
        },
    )
}

fn names(history: &[RuntimeState]) -> Vec<&'static str> {
    history.iter().map(RuntimeState::name).collect()
}

/// Test: a fresh plugin goes through every stage and serves calls
#[tokio::test]
async fn test_fresh_plugin_becomes_ready_and_serves() {
    let fake = FakePython::new(ECHO_PLUGIN, "echo 'Successfully installed requests'");
    let dir = fake.plugin_dir("echo");
    let identity = PluginIdentity::from_parts("acme", "echo", "0.1.0");
    let registry = RuntimeRegistry::new();
    let runtime = runtime(&registry, &fake, &identity, &dir);

    runtime.init_environment().await.unwrap();
    let handle = runtime.handle().clone();
    assert_eq!(
        names(&handle.history()),
        vec!["uninitialized", "provisioning", "installing_dependencies", "ready"]
    );
    assert!(handle.state().interpreter().unwrap().ends_with(".venv/bin/python"));
    assert_eq!(fake.calls(), vec!["venv", "pip"]);

    runtime.start().await.unwrap();
    let mut rx = registry
        .lookup_ready(&identity)
        .unwrap()
        .invoke(InvocationRequest {
            method: "tool.invoke".to_string(),
            payload: serde_json::json!({ "city": "Oslo" }),
        })
        .await
        .unwrap();

    assert_eq!(
        rx.recv().await,
        Some(InvocationEvent::Chunk(serde_json::json!({ "method": "tool.invoke" })))
    );
    assert_eq!(rx.recv().await, None);

    runtime.stop().await;
    assert_eq!(handle.state(), RuntimeState::Stopped);
    assert!(handle.process().is_none());
}

/// Test: a failed install leaves the handle failed and removes the environment
#[tokio::test]
async fn test_failed_install_cleans_up() {
    let fake = FakePython::new(
        ECHO_PLUGIN,
        "echo 'ERROR: Could not find a version that satisfies the requirement nope' >&2\nexit 1",
    );
    let dir = fake.plugin_dir("broken");
    let identity = PluginIdentity::from_parts("acme", "broken", "0.1.0");
    let registry = RuntimeRegistry::new();
    let runtime = runtime(&registry, &fake, &identity, &dir);

    let err = runtime.init_environment().await.unwrap_err();
    assert!(matches!(err, RuntimeError::ProcessFailed { .. }), "{err:?}");
    assert!(err.output().unwrap().contains("Could not find a version"));

    match runtime.handle().state() {
        RuntimeState::Failed { reason } => assert!(reason.contains("installing acme/broken:0.1.0")),
        other => panic!("expected failed, got {other:?}"),
    }
    assert!(!dir.join(".venv").exists());
    assert!(matches!(
        registry.lookup_ready(&identity),
        Err(RuntimeError::NotReady { .. })
    ));

    // A failed handle may be replaced and retried
    assert!(registry.begin(identity, &dir).is_ok());
}

/// Test: a second start reuses the environment without reinstalling
#[tokio::test]
async fn test_restart_reuses_environment() {
    let fake = FakePython::new(ECHO_PLUGIN, "exit 0");
    let dir = fake.plugin_dir("reuse");
    let identity = PluginIdentity::from_parts("acme", "reuse", "1.0.0");
    let registry = RuntimeRegistry::new();

    let first = runtime(&registry, &fake, &identity, &dir);
    first.init_environment().await.unwrap();
    first.stop().await;
    assert_eq!(first.handle().state(), RuntimeState::Stopped);

    let second = runtime(&registry, &fake, &identity, &dir);
    second.init_environment().await.unwrap();
    assert!(second.handle().state().is_ready());
    assert_eq!(fake.calls(), vec!["venv", "pip"]);
}

/// Test: a reused environment whose interpreter vanished is rebuilt next time
#[tokio::test]
async fn test_stale_environment_is_removed() {
    let fake = FakePython::new(ECHO_PLUGIN, "exit 0");
    let dir = fake.plugin_dir("stale");
    std::fs::create_dir_all(dir.join(".venv")).unwrap();
    let identity = PluginIdentity::from_parts("acme", "stale", "1.0.0");
    let registry = RuntimeRegistry::new();

    let first = runtime(&registry, &fake, &identity, &dir);
    let err = first.init_environment().await.unwrap_err();
    assert!(matches!(err, RuntimeError::InterpreterNotFound(_)), "{err:?}");
    assert!(!dir.join(".venv").exists());
    assert!(fake.calls().is_empty());

    let second = runtime(&registry, &fake, &identity, &dir);
    second.init_environment().await.unwrap();
    assert_eq!(fake.calls(), vec!["venv", "pip"]);
}

/// Test: only one provisioning attempt runs per identity
#[tokio::test]
async fn test_concurrent_begin_is_rejected() {
    let fake = FakePython::new(ECHO_PLUGIN, "sleep 1");
    let dir = fake.plugin_dir("busy");
    let identity = PluginIdentity::from_parts("acme", "busy", "1.0.0");
    let registry = RuntimeRegistry::new();

    let runtime = Arc::new(runtime(&registry, &fake, &identity, &dir));
    let task = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.init_environment().await }
    });

    assert!(
        eventually(Duration::from_secs(5), || runtime.handle().state().is_in_flight()).await
    );
    assert!(matches!(
        registry.begin(identity.clone(), &dir),
        Err(RuntimeError::AlreadyProvisioning(_))
    ));
    assert!(matches!(
        runtime.init_environment().await,
        Err(RuntimeError::AlreadyProvisioning(_))
    ));

    task.await.unwrap().unwrap();
    assert!(runtime.handle().state().is_ready());
}

/// Test: a crashing plugin is restarted up to the limit, then failed
#[tokio::test]
async fn test_crashing_plugin_exhausts_restarts() {
    let fake = FakePython::new(CRASHING_PLUGIN, "exit 0");
    let dir = fake.plugin_dir("crash");
    let identity = PluginIdentity::from_parts("acme", "crash", "1.0.0");
    let registry = RuntimeRegistry::new();
    let runtime = runtime(&registry, &fake, &identity, &dir);

    runtime.init_environment().await.unwrap();
    runtime.start().await.unwrap();

    let mut states = runtime.handle().subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|state| matches!(state, RuntimeState::Failed { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(runtime.handle().restarts(), 2);
    assert!(runtime.handle().process().is_none());
}

/// Test: a zero health interval still runs the monitor
#[tokio::test]
async fn test_zero_health_interval_keeps_monitor() {
    let fake = FakePython::new(CRASHING_PLUGIN, "exit 0");
    let dir = fake.plugin_dir("crash-zero");
    let identity = PluginIdentity::from_parts("acme", "crash-zero", "1.0.0");
    let registry = RuntimeRegistry::new();
    let runtime = LocalPluginRuntime::new(
        registry.begin(identity, &dir).unwrap(),
        Arc::new(PythonProvisioner::new(&fake.base)),
        Supervisor::new(SupervisorConfig::default()),
        LocalRuntimeConfig {
            health_interval: Duration::ZERO,
            restart_backoff: Duration::from_millis(10),
            max_restarts: 1,
            ..LocalRuntimeConfig::default()
        },
    );

    runtime.init_environment().await.unwrap();
    runtime.start().await.unwrap();

    let mut states = runtime.handle().subscribe();
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|state| matches!(state, RuntimeState::Failed { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(runtime.handle().restarts(), 1);
}
