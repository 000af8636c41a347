use std::sync::Arc;
use std::time::Duration;

use kd_bridge::protocol::{TerminalClientEvent, TerminalServerEvent};
use kd_bridge::terminal_bridge::TerminalBridge;
use kd_core::cluster_config::KindConfigBuilder;
use kd_core::config::{TerminalConfig, ToolsConfig};
use kd_core::store::EnvironmentStore;
use kd_core::types::{Environment, EnvironmentSpec, EnvironmentStatus};
use kd_provision::lifecycle::LifecycleManager;
use kd_provision::runner::CommandOutput;
use kd_provision::testing::ScriptedRunner;
use kd_provision::workflow::ProvisioningWorkflow;
use kd_session::pty::{PtyProcess, PtyRequest, PtySpawner};
use kd_session::registry::SessionRegistry;
use kd_session::testing::{wait_for, FakePtySpawner};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    lifecycle: Arc<LifecycleManager>,
    bridge: Arc<TerminalBridge>,
    spawner: Arc<FakePtySpawner>,
    runner: Arc<ScriptedRunner>,
    _dir: tempfile::TempDir,
}

/// Holds every `spawn` until the test releases it.
struct BlockingSpawner {
    inner: Arc<FakePtySpawner>,
    entered: flume::Sender<()>,
    release: flume::Receiver<()>,
}

impl PtySpawner for BlockingSpawner {
    fn spawn(&self, request: &PtyRequest) -> kd_session::pty::Result<Box<dyn PtyProcess>> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        self.inner.spawn(request)
    }
}

fn harness() -> Harness {
    harness_with(|fake| fake as Arc<dyn PtySpawner>)
}

fn harness_with<F>(wrap: F) -> Harness
where
    F: FnOnce(Arc<FakePtySpawner>) -> Arc<dyn PtySpawner>,
{
    let dir = tempfile::tempdir().unwrap();
    let tools = ToolsConfig {
        config_dir: Some(dir.path().display().to_string()),
        ..ToolsConfig::default()
    };
    let runner = Arc::new(ScriptedRunner::new());
    runner.respond("docker", &["ps"], CommandOutput::ok("abc123\n"));
    let workflow = Arc::new(ProvisioningWorkflow::new(
        Arc::new(EnvironmentStore::default()),
        runner.clone(),
        Arc::new(KindConfigBuilder),
        tools,
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        workflow,
        Arc::new(SessionRegistry::new()),
    ));
    let spawner = Arc::new(FakePtySpawner::new());
    let bridge = Arc::new(TerminalBridge::new(
        lifecycle.clone(),
        wrap(spawner.clone()),
        TerminalConfig::default(),
        "docker",
    ));
    Harness {
        lifecycle,
        bridge,
        spawner,
        runner,
        _dir: dir,
    }
}

async fn wait_for_status(h: &Harness, id: Uuid, status: EnvironmentStatus) {
    let lifecycle = h.lifecycle.clone();
    let reached = wait_for(Duration::from_secs(2), move || {
        lifecycle.get_environment(&id).map(|e| e.status).ok() == Some(status)
    })
    .await;
    assert!(reached, "environment never reached {status}");
}

async fn running_env(h: &Harness) -> Environment {
    let env = h
        .lifecycle
        .create_environment(&EnvironmentSpec::with_nodes(3))
        .unwrap();
    wait_for_status(h, env.id, EnvironmentStatus::Running).await;
    h.lifecycle.get_environment(&env.id).unwrap()
}

async fn next_event(events: &flume::Receiver<TerminalServerEvent>) -> TerminalServerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv_async())
        .await
        .expect("timed out waiting for terminal event")
        .expect("event channel closed")
}

fn start(environment_id: Uuid) -> TerminalClientEvent {
    TerminalClientEvent::StartTerminal {
        environment_id,
        cols: None,
        rows: None,
    }
}

fn input(data: &str) -> TerminalClientEvent {
    TerminalClientEvent::TerminalInput { data: data.into() }
}

fn assert_error(event: TerminalServerEvent, needle: &str) {
    match event {
        TerminalServerEvent::TerminalError { message } => {
            assert!(message.contains(needle), "unexpected message: {message}")
        }
        other => panic!("expected terminal-error, got {other:?}"),
    }
}

// ===========================================================================
// Session start
// ===========================================================================

#[tokio::test]
async fn test_start_on_running_environment_then_input_reaches_process() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    assert_eq!(
        next_event(&events).await,
        TerminalServerEvent::TerminalReady {
            environment_id: env.id
        }
    );

    connection.handle(input("ls\n"));
    let process = h.spawner.last().unwrap();
    assert_eq!(process.input(), b"ls\n");
    assert_eq!(h.bridge.sessions().len(), 1);
}

#[tokio::test]
async fn test_shell_runs_in_control_plane_container() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    next_event(&events).await;

    let process = h.spawner.last().unwrap();
    let request = process.request();
    assert_eq!(request.program, "docker");
    assert_eq!(request.args, ["exec", "-it", "abc123", "/bin/bash"]);
    assert_eq!((request.cols, request.rows), (80, 24));
    assert!(request
        .env
        .iter()
        .any(|(k, v)| k == "TERM" && v == "xterm-color"));
}

#[tokio::test]
async fn test_requested_geometry_is_honored() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(TerminalClientEvent::StartTerminal {
        environment_id: env.id,
        cols: Some(132),
        rows: Some(43),
    });
    next_event(&events).await;

    let request = h.spawner.last().unwrap().request().clone();
    assert_eq!((request.cols, request.rows), (132, 43));
    let session = h.bridge.sessions().lookup(&connection.id()).unwrap();
    assert_eq!(session.geometry(), (132, 43));
}

#[tokio::test]
async fn test_start_on_creating_environment_is_rejected() {
    let h = harness();
    let gate = h
        .runner
        .respond_gated("kind", &["create"], CommandOutput::ok(""));
    let env = h
        .lifecycle
        .create_environment(&EnvironmentSpec::with_nodes(1))
        .unwrap();
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    assert_error(next_event(&events).await, "creating");
    assert_eq!(h.spawner.spawn_count(), 0);
    assert!(h.bridge.sessions().is_empty());

    gate.release();
}

#[tokio::test]
async fn test_start_on_errored_environment_is_rejected() {
    let h = harness();
    h.runner
        .respond("kind", &["create"], CommandOutput::failed(1, "boom"));
    let env = h
        .lifecycle
        .create_environment(&EnvironmentSpec::with_nodes(1))
        .unwrap();
    wait_for_status(&h, env.id, EnvironmentStatus::Error).await;
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    assert_error(next_event(&events).await, "error");
    assert!(h.bridge.sessions().is_empty());
}

#[tokio::test]
async fn test_start_on_unknown_environment_is_rejected() {
    let h = harness();
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(Uuid::new_v4()));
    assert_error(next_event(&events).await, "not found");
    assert_eq!(h.spawner.spawn_count(), 0);
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let h = harness();
    let env = running_env(&h).await;
    h.spawner.fail_next_spawn("no pty available");
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    assert_error(next_event(&events).await, "no pty available");
    assert!(h.bridge.sessions().is_empty());
}

// ===========================================================================
// Session I/O
// ===========================================================================

#[tokio::test]
async fn test_output_is_forwarded_in_order() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    let process = h.spawner.last().unwrap();
    for chunk in ["one ", "two ", "three"] {
        assert!(process.emit(chunk.as_bytes()));
    }

    let mut text = String::new();
    while text.len() < "one two three".len() {
        match next_event(&events).await {
            TerminalServerEvent::TerminalOutput { data } => text.push_str(&data),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(text, "one two three");
}

#[tokio::test]
async fn test_input_is_written_in_order() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    connection.handle(input("echo "));
    connection.input(b"hi");
    connection.handle(input("\n"));
    assert_eq!(h.spawner.last().unwrap().input(), b"echo hi\n");
}

#[tokio::test]
async fn test_input_and_resize_without_session_are_ignored() {
    let h = harness();
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(input("ls\n"));
    connection.handle(TerminalClientEvent::TerminalResize {
        cols: 100,
        rows: 30,
    });
    assert!(events.try_recv().is_err());
    assert_eq!(h.spawner.spawn_count(), 0);
}

#[tokio::test]
async fn test_resize_is_forwarded_and_zero_size_ignored() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    connection.handle(TerminalClientEvent::TerminalResize {
        cols: 100,
        rows: 30,
    });
    connection.handle(TerminalClientEvent::TerminalResize { cols: 0, rows: 30 });

    assert_eq!(h.spawner.last().unwrap().resizes(), vec![(100, 30)]);
    let session = h.bridge.sessions().lookup(&connection.id()).unwrap();
    assert_eq!(session.geometry(), (100, 30));
}

#[tokio::test]
async fn test_process_exit_emits_exit_and_unregisters() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    let process = h.spawner.last().unwrap();
    process.emit(b"bye\n");
    process.exit(3);

    assert_eq!(
        next_event(&events).await,
        TerminalServerEvent::TerminalOutput {
            data: "bye\n".into()
        }
    );
    assert_eq!(
        next_event(&events).await,
        TerminalServerEvent::TerminalExit { code: Some(3) }
    );
    assert!(h.bridge.sessions().lookup(&connection.id()).is_none());
}

#[tokio::test]
async fn test_malformed_text_frame_reports_error() {
    let h = harness();
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle_text("{not json");
    assert_error(next_event(&events).await, "malformed");
}

// ===========================================================================
// Session teardown
// ===========================================================================

#[tokio::test]
async fn test_closing_connection_kills_session_once() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    connection.close();
    connection.close();

    let process = h.spawner.last().unwrap();
    assert_eq!(process.kill_count(), 1);
    assert!(h.bridge.sessions().is_empty());

    connection.handle(start(env.id));
    assert_eq!(h.spawner.spawn_count(), 1);
}

#[tokio::test]
async fn test_dropping_connection_kills_session() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    drop(connection);

    assert_eq!(h.spawner.last().unwrap().kill_count(), 1);
    assert!(h.bridge.sessions().is_empty());
}

#[tokio::test]
async fn test_disconnect_leaves_other_connections_alone() {
    let h = harness();
    let env = running_env(&h).await;

    let first = h.bridge.connect();
    let first_events = first.events();
    first.handle(start(env.id));
    next_event(&first_events).await;

    let second = h.bridge.connect();
    let second_events = second.events();
    second.handle(start(env.id));
    next_event(&second_events).await;

    first.close();

    let processes = h.spawner.processes();
    assert_eq!(processes[0].kill_count(), 1);
    assert_eq!(processes[1].kill_count(), 0);
    second.handle(input("pwd\n"));
    assert_eq!(processes[1].input(), b"pwd\n");
}

#[tokio::test]
async fn test_restarting_replaces_previous_session() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();

    connection.handle(start(env.id));
    next_event(&events).await;
    connection.handle(start(env.id));
    assert!(matches!(
        next_event(&events).await,
        TerminalServerEvent::TerminalReady { .. }
    ));

    let processes = h.spawner.processes();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0].kill_count(), 1);
    assert_eq!(processes[1].kill_count(), 0);
    assert_eq!(h.bridge.sessions().len(), 1);

    // The replaced session does not report an exit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());

    connection.handle(input("x"));
    assert!(processes[0].input().is_empty());
    assert_eq!(processes[1].input(), b"x");
}

#[tokio::test]
async fn test_deleting_environment_ends_its_sessions() {
    let h = harness();
    let env = running_env(&h).await;
    let connection = h.bridge.connect();
    let events = connection.events();
    connection.handle(start(env.id));
    next_event(&events).await;

    h.lifecycle.delete_environment(&env.id).await.unwrap();

    assert_eq!(h.spawner.last().unwrap().kill_count(), 1);
    assert!(h.bridge.sessions().is_empty());
    assert!(matches!(
        next_event(&events).await,
        TerminalServerEvent::TerminalExit { .. }
    ));
}

#[tokio::test]
async fn test_start_racing_environment_delete_leaves_no_session() {
    let (entered_tx, entered_rx) = flume::unbounded();
    let (release_tx, release_rx) = flume::unbounded();
    let h = harness_with(move |fake| {
        Arc::new(BlockingSpawner {
            inner: fake,
            entered: entered_tx,
            release: release_rx,
        }) as Arc<dyn PtySpawner>
    });
    let env = running_env(&h).await;
    let connection = Arc::new(h.bridge.connect());
    let events = connection.events();

    let starting = {
        let connection = connection.clone();
        let id = env.id;
        tokio::task::spawn_blocking(move || connection.handle(start(id)))
    };
    entered_rx.recv_async().await.unwrap();

    h.lifecycle.delete_environment(&env.id).await.unwrap();
    release_tx.send(()).unwrap();
    starting.await.unwrap();

    assert_error(next_event(&events).await, "no longer running");
    assert!(events.try_recv().is_err());
    assert!(h.bridge.sessions().all_for_environment(&env.id).is_empty());
    assert!(h.bridge.sessions().lookup(&connection.id()).is_none());
    assert_eq!(h.spawner.last().unwrap().kill_count(), 1);
}
