//! Supervisor policy tests
//!
//! These exercise the restart, quarantine and state-transition policy of
//! the process manager without forking real worker processes: records are
//! seeded straight into the registry and events are fed through the same
//! handlers the supervisor loop uses.
//!
//! Test coverage:
//! - Three consecutive connection failures quarantine the mesh
//! - Kicked workers are permanently blocked and never respawned
//! - Restart budget is bounded and exits in terminal states are final
//! - Remote-initiated closes stop the worker without a restart

use std::sync::Arc;
use std::time::Duration;

use meshherd::config::MeshherdConfig;
use meshherd::directory::{MeshDetails, MeshDirectory, MeshSummary, StaticMeshDirectory};
use meshherd::protocol::WorkerEvent;
use meshherd::supervisor::{
    BlockReason, MeshProcessManager, ProcessRecord, ProcessState, QuarantineStore, SupervisorMsg,
};
use meshherd::worker::MeshWorkerConfig;
use tokio::sync::mpsc;

struct Harness {
    manager: MeshProcessManager,
    quarantine: Arc<tokio::sync::Mutex<QuarantineStore>>,
    msg_rx: mpsc::Receiver<SupervisorMsg>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MeshherdConfig::default();
    config.supervisor.restart_delay_secs = 1;

    let quarantine = QuarantineStore::load(
        dir.path().join("blocked-meshes.json"),
        chrono::Duration::hours(1),
    )
    .await
    .unwrap();
    let quarantine = Arc::new(tokio::sync::Mutex::new(quarantine));

    let directory: Arc<dyn MeshDirectory> = Arc::new(StaticMeshDirectory::new(vec![MeshDetails {
        id: "abc".to_string(),
        endpoint: Some("wss://mesh.example.com/ws".to_string()),
        participants: vec![],
    }]));

    let (msg_tx, msg_rx) = mpsc::channel(64);
    let manager = MeshProcessManager::new(
        Arc::new(config),
        directory,
        Arc::clone(&quarantine),
        msg_tx,
    );

    Harness {
        manager,
        quarantine,
        msg_rx,
        _dir: dir,
    }
}

fn seed_record(manager: &MeshProcessManager, mesh_id: &str, state: ProcessState) {
    let mut record = ProcessRecord::new(
        mesh_id.to_string(),
        serde_json::Value::Null,
        MeshWorkerConfig {
            mesh_id: mesh_id.to_string(),
            endpoint: "wss://mesh.example.com/ws".to_string(),
            auth_token: None,
            device_id: "host".to_string(),
            peer_id: "bot".to_string(),
            command_prefixes: vec![],
            debug: false,
        },
    );
    record.state = state;
    assert!(manager.registry().try_reserve(record));
}

fn summary(mesh_id: &str) -> MeshSummary {
    MeshSummary {
        id: mesh_id.to_string(),
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn three_connection_failures_quarantine_the_mesh() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Ready);

    for attempt in 1..=2 {
        h.manager
            .handle_event("abc", WorkerEvent::ConnectionFailed { attempt })
            .await
            .unwrap();
        let record = h.manager.registry().get("abc").unwrap();
        assert_eq!(record.connection_attempts, attempt);
        assert_ne!(record.state, ProcessState::Blocked);
        assert!(!h.quarantine.lock().await.is_blocked("abc").await);
    }

    h.manager
        .handle_event("abc", WorkerEvent::ConnectionFailed { attempt: 3 })
        .await
        .unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert_eq!(record.state, ProcessState::Blocked);

    let mut quarantine = h.quarantine.lock().await;
    assert!(quarantine.is_blocked("abc").await);
    let entry = quarantine.get("abc").unwrap();
    assert_eq!(entry.reason, BlockReason::ConnectionFailures);
    // Temporary block: roughly one hour out
    let ttl = entry.blocked_until.expect("failure block must have a TTL") - entry.blocked_at;
    assert_eq!(ttl, chrono::Duration::hours(1));
}

#[tokio::test]
async fn blocked_mesh_is_not_respawned_by_discovery() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Ready);
    for attempt in 1..=3 {
        h.manager
            .handle_event("abc", WorkerEvent::ConnectionFailed { attempt })
            .await
            .unwrap();
    }

    // Process exit in Blocked state removes the record for good
    h.manager.handle_exit("abc", Some(1)).await.unwrap();
    assert!(h.manager.registry().get("abc").is_none());

    // Discovery still lists "abc" but the spawn is refused
    let spawned = h.manager.spawn_for(&summary("abc")).await.unwrap();
    assert!(!spawned);
    assert!(h.manager.registry().get("abc").is_none());
}

#[tokio::test]
async fn kicked_worker_is_permanently_blocked() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Connected);

    h.manager
        .handle_event("abc", WorkerEvent::Kicked)
        .await
        .unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert!(record.kicked);
    assert_eq!(record.state, ProcessState::Stopped);

    {
        let mut quarantine = h.quarantine.lock().await;
        let entry = quarantine.get("abc").unwrap();
        assert_eq!(entry.reason, BlockReason::Kicked);
        assert_eq!(entry.blocked_until, None);
        assert!(quarantine.is_blocked("abc").await);
    }

    // Exit is final, no restart
    h.manager.handle_exit("abc", Some(0)).await.unwrap();
    assert!(h.manager.registry().get("abc").is_none());
    assert!(!h.manager.spawn_for(&summary("abc")).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn abnormal_exit_schedules_a_delayed_restart() {
    let mut h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Disconnected);

    h.manager.handle_exit("abc", Some(1)).await.unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert_eq!(record.state, ProcessState::Restarting);
    assert_eq!(record.retry_count, 1);

    // The restart delay elapses (virtual time) and the respawn message lands
    let msg = tokio::time::timeout(Duration::from_secs(5), h.msg_rx.recv())
        .await
        .expect("respawn message should arrive")
        .expect("channel open");
    match msg {
        SupervisorMsg::RespawnDue { mesh_id } => assert_eq!(mesh_id, "abc"),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn restart_budget_is_never_exceeded() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Disconnected);
    let max = 5;

    // Rapid repeated crashes: each exit consumes one restart
    for expected_retry in 1..=max {
        h.manager.handle_exit("abc", Some(1)).await.unwrap();
        let record = h.manager.registry().get("abc").unwrap();
        assert_eq!(record.retry_count, expected_retry);
        assert_eq!(record.state, ProcessState::Restarting);
        // Simulate the respawned worker crashing again before any event
        h.manager
            .registry()
            .with_record("abc", |r| r.state = ProcessState::Ready);
    }

    // Budget exhausted: the next exit removes the record permanently
    h.manager.handle_exit("abc", Some(1)).await.unwrap();
    assert!(h.manager.registry().get("abc").is_none());
}

#[tokio::test]
async fn remote_initiated_close_stops_without_restart() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Connected);

    h.manager
        .handle_event(
            "abc",
            WorkerEvent::Disconnected {
                reason: "Mesh closed by server".to_string(),
            },
        )
        .await
        .unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert_eq!(record.state, ProcessState::Stopped);
    assert!(record.server_disconnected);

    h.manager.handle_exit("abc", Some(0)).await.unwrap();
    assert!(h.manager.registry().get("abc").is_none());
}

#[tokio::test]
async fn ordinary_disconnect_keeps_the_worker() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Connected);

    h.manager
        .handle_event(
            "abc",
            WorkerEvent::Disconnected {
                reason: "network error".to_string(),
            },
        )
        .await
        .unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert_eq!(record.state, ProcessState::Disconnected);
    assert!(!record.server_disconnected);
}

#[tokio::test]
async fn connected_event_resets_connection_attempts() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Ready);

    h.manager
        .handle_event("abc", WorkerEvent::ConnectionFailed { attempt: 1 })
        .await
        .unwrap();
    h.manager
        .handle_event("abc", WorkerEvent::Connected)
        .await
        .unwrap();

    let record = h.manager.registry().get("abc").unwrap();
    assert_eq!(record.state, ProcessState::Connected);
    assert_eq!(record.connection_attempts, 0);
}

#[tokio::test]
async fn spawn_is_refused_while_a_record_exists() {
    let h = harness().await;
    seed_record(&h.manager, "abc", ProcessState::Connected);

    // Same mesh, second spawn attempt: refused, registry untouched
    assert!(!h.manager.spawn_for(&summary("abc")).await.unwrap());
    assert_eq!(h.manager.registry().len(), 1);
}
