//! Worker process contract tests
//!
//! Run the real compiled binary in worker mode against an endpoint that
//! refuses connections, and verify the IPC contract the supervisor relies
//! on: ready first, connection_failed on failure, status_response echoing
//! the correlation ID, and exit code 0 on graceful shutdown.

use std::process::Stdio;
use std::time::Duration;

use meshherd::protocol::{IpcEnvelope, IpcPayload, WorkerCommand, WorkerEvent};
use meshherd::worker::MeshWorkerConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// A loopback port with nothing listening: bind, read the port, drop the
/// listener. Connects are then refused immediately.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn worker_config() -> MeshWorkerConfig {
    MeshWorkerConfig {
        mesh_id: "contract-test".to_string(),
        endpoint: format!("ws://127.0.0.1:{}/", closed_port()),
        auth_token: None,
        device_id: "test-host".to_string(),
        peer_id: "test-bot".to_string(),
        command_prefixes: vec![],
        debug: false,
    }
}

fn spawn_worker() -> Child {
    Command::new(env!("CARGO_BIN_EXE_meshherd"))
        .arg("worker")
        .arg("--config")
        .arg(serde_json::to_string(&worker_config()).unwrap())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("worker binary should spawn")
}

async fn next_envelope(lines: &mut Lines<BufReader<ChildStdout>>) -> IpcEnvelope {
    loop {
        let line = tokio::time::timeout(Duration::from_secs(15), lines.next_line())
            .await
            .expect("worker output within timeout")
            .expect("stdout readable")
            .expect("stdout open");
        if let Some(envelope) = meshherd::protocol::parse_line(&line) {
            return envelope;
        }
    }
}

async fn send(stdin: &mut ChildStdin, envelope: &IpcEnvelope) {
    let mut line = serde_json::to_string(envelope).unwrap();
    line.push('\n');
    stdin.write_all(line.as_bytes()).await.unwrap();
    stdin.flush().await.unwrap();
}

#[tokio::test]
async fn worker_honors_the_ipc_contract() {
    let mut child = spawn_worker();
    let stdout = child.stdout.take().unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut lines = BufReader::new(stdout).lines();

    // Ready must come before anything else
    let first = next_envelope(&mut lines).await;
    assert!(
        matches!(
            first.payload,
            IpcPayload::Event {
                event: WorkerEvent::Ready
            }
        ),
        "first envelope must be ready, got {:?}",
        first.payload
    );

    // The endpoint refuses connections, so a failure report follows
    let second = next_envelope(&mut lines).await;
    match second.payload {
        IpcPayload::Event {
            event: WorkerEvent::ConnectionFailed { attempt },
        } => assert_eq!(attempt, 1),
        other => panic!("expected connection_failed, got {other:?}"),
    }

    // Status requests are served even while waiting to reconnect. Further
    // connection_failed events may interleave; skip past them.
    send(&mut stdin, &IpcEnvelope::status_request("probe-1")).await;
    let response = loop {
        let envelope = next_envelope(&mut lines).await;
        match envelope.payload {
            IpcPayload::StatusResponse { .. } => break envelope,
            IpcPayload::Event { .. } => continue,
            other => panic!("expected status_response, got {other:?}"),
        }
    };
    match response.payload {
        IpcPayload::StatusResponse { status } => {
            assert!(!status.connected);
            assert!(status.connection_attempts >= 1);
            assert_eq!(status.state, "disconnected");
        }
        _ => unreachable!(),
    }
    assert_eq!(response.correlation_id.as_deref(), Some("probe-1"));

    // Graceful shutdown: exit code 0
    send(
        &mut stdin,
        &IpcEnvelope::command(WorkerCommand::Shutdown { graceful: true }),
    )
    .await;
    let exit = tokio::time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("worker should exit after shutdown")
        .unwrap();
    assert_eq!(exit.code(), Some(0));
}

#[tokio::test]
async fn worker_rejects_malformed_config() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_meshherd"))
        .arg("worker")
        .arg("--config")
        .arg("{not json")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(15), child.wait())
        .await
        .expect("worker should exit quickly")
        .unwrap();
    assert_ne!(exit.code(), Some(0));
}
