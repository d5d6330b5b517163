//! Worker process entry: drives one connection session against one mesh
//! and speaks the control protocol with the supervisor.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::protocol::{
    parse_line, IpcEnvelope, IpcPayload, IpcWriter, WorkerCommand, WorkerEvent, WorkerStatus,
};
use crate::worker::session::{ConnectionSession, SessionEvent, SessionSettings, SessionState};
use crate::worker::MeshWorkerConfig;

/// Exponential backoff with cap and jitter for session reconnects.
///
/// This is the worker's own policy, distinct from the supervisor's fixed
/// process-restart delay.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.cap);
        let jitter_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64 / 10);
        capped + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// What the runtime loop should do after handling an event or command.
enum Flow {
    Continue,
    Reconnect,
    Exit(i32),
}

/// Per-process worker state: one mesh, one session at a time.
pub struct WorkerRuntime {
    config: MeshWorkerConfig,
    session_config: SessionConfig,
    out: IpcWriter<tokio::io::Stdout>,
    started_at: Instant,
    /// Completed reconnect rounds since the last successful connect
    retry_count: u32,
    /// Failed connection attempts since the last successful connect
    connection_attempts: u32,
    connected: bool,
    last_error: Option<String>,
}

impl WorkerRuntime {
    pub fn new(config: MeshWorkerConfig, session_config: SessionConfig) -> Self {
        Self {
            config,
            session_config,
            out: IpcWriter::new(tokio::io::stdout()),
            started_at: Instant::now(),
            retry_count: 0,
            connection_attempts: 0,
            connected: false,
            last_error: None,
        }
    }

    /// Run until shutdown. Returns the process exit code: 0 for a graceful
    /// stop, non-zero for fatal conditions.
    pub async fn run(mut self) -> Result<i32> {
        // Contract with the supervisor: ready always precedes connected.
        self.emit(WorkerEvent::Ready).await?;
        info!(mesh_id = %self.config.mesh_id, "Worker ready");

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<IpcEnvelope>(32);
        spawn_command_reader(cmd_tx);

        let mut backoff = Backoff::new(
            Duration::from_millis(self.session_config.reconnect_base_ms),
            Duration::from_secs(self.session_config.reconnect_cap_secs),
        );

        loop {
            let settings = SessionSettings::from_config(&self.config, &self.session_config);
            let (session, mut session_events) = ConnectionSession::new(settings);

            match session.connect().await {
                Ok(()) => {}
                Err(e) => {
                    self.connection_attempts += 1;
                    self.last_error = Some(e.to_string());
                    warn!(
                        mesh_id = %self.config.mesh_id,
                        attempt = self.connection_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                    self.emit(WorkerEvent::ConnectionFailed {
                        attempt: self.connection_attempts,
                    })
                    .await?;

                    self.retry_count = self.retry_count.saturating_add(1);
                    let delay = backoff.next_delay();
                    match self.wait_backoff(&mut cmd_rx, delay).await? {
                        Flow::Exit(code) => return Ok(code),
                        _ => continue,
                    }
                }
            }

            // Connected: counters reset, as does the backoff schedule
            backoff.reset();
            self.retry_count = 0;
            self.connected = true;
            self.emit(WorkerEvent::Connected).await?;
            info!(mesh_id = %self.config.mesh_id, "Connected to mesh");

            let flow = self
                .connected_loop(&session, &mut session_events, &mut cmd_rx)
                .await?;
            self.connected = false;

            match flow {
                Flow::Exit(code) => {
                    session.disconnect().await;
                    return Ok(code);
                }
                Flow::Reconnect => {
                    let delay = backoff.next_delay();
                    self.retry_count = self.retry_count.saturating_add(1);
                    match self.wait_backoff(&mut cmd_rx, delay).await? {
                        Flow::Exit(code) => return Ok(code),
                        _ => continue,
                    }
                }
                Flow::Continue => continue,
            }
        }
    }

    /// Serve session events and parent commands while connected.
    async fn connected_loop(
        &mut self,
        session: &ConnectionSession,
        session_events: &mut mpsc::Receiver<SessionEvent>,
        cmd_rx: &mut mpsc::Receiver<IpcEnvelope>,
    ) -> Result<Flow> {
        loop {
            tokio::select! {
                event = session_events.recv() => {
                    let Some(event) = event else {
                        return Ok(Flow::Reconnect);
                    };
                    match event {
                        SessionEvent::Connected => {}
                        SessionEvent::Message(value) => {
                            // Chat dispatch is an external collaborator;
                            // meshherd only keeps the session alive.
                            debug!(mesh_id = %self.config.mesh_id, message = %value, "Mesh traffic");
                        }
                        SessionEvent::Disconnected { code, reason } => {
                            return self.handle_close(session, code, reason).await;
                        }
                    }
                }
                envelope = cmd_rx.recv() => {
                    let Some(envelope) = envelope else {
                        // Parent went away; nothing sane left to do
                        return Ok(Flow::Exit(1));
                    };
                    match self.handle_envelope(envelope, Some(session)).await? {
                        Flow::Continue => {}
                        other => return Ok(other),
                    }
                }
            }
        }
    }

    /// Classify a session close and decide what happens next.
    async fn handle_close(
        &mut self,
        session: &ConnectionSession,
        code: Option<u16>,
        reason: String,
    ) -> Result<Flow> {
        if is_kick(code, &reason) {
            warn!(mesh_id = %self.config.mesh_id, reason = %reason, "Kicked from mesh");
            self.emit(WorkerEvent::Kicked).await?;
            return Ok(Flow::Exit(0));
        }

        if session.was_closed_immediately() {
            // Closed within seconds of connecting: permanent rejection,
            // retrying would only repeat it.
            self.connection_attempts += 1;
            self.last_error = Some(format!("rejected: {reason}"));
            warn!(
                mesh_id = %self.config.mesh_id,
                code = ?code,
                reason = %reason,
                "Mesh rejected the connection immediately; giving up"
            );
            self.emit(WorkerEvent::ConnectionFailed {
                attempt: self.connection_attempts,
            })
            .await?;
            self.emit(WorkerEvent::Error {
                message: format!("mesh rejected connection: {reason}"),
            })
            .await?;
            return Ok(Flow::Exit(1));
        }

        info!(mesh_id = %self.config.mesh_id, code = ?code, reason = %reason, "Session closed");
        self.emit(WorkerEvent::Disconnected { reason }).await?;
        Ok(Flow::Reconnect)
    }

    /// Handle one parent envelope. `session` is `None` while between
    /// connections (backoff wait).
    async fn handle_envelope(
        &mut self,
        envelope: IpcEnvelope,
        session: Option<&ConnectionSession>,
    ) -> Result<Flow> {
        let correlation_id = envelope.correlation_id.clone();
        match envelope.payload {
            IpcPayload::Command { command } => match command {
                WorkerCommand::Shutdown { graceful } => {
                    info!(mesh_id = %self.config.mesh_id, graceful, "Shutdown command received");
                    if let Some(session) = session {
                        session.disconnect().await;
                    }
                    Ok(Flow::Exit(0))
                }
                WorkerCommand::StatusRequest => {
                    self.send_status(correlation_id).await?;
                    Ok(Flow::Continue)
                }
                WorkerCommand::RestartConnection => {
                    info!(mesh_id = %self.config.mesh_id, "Restarting connection on request");
                    if let Some(session) = session {
                        session.disconnect().await;
                        self.emit(WorkerEvent::Disconnected {
                            reason: "restart requested".to_string(),
                        })
                        .await?;
                        Ok(Flow::Reconnect)
                    } else {
                        Ok(Flow::Continue)
                    }
                }
                WorkerCommand::RefreshAdmins | WorkerCommand::RefreshPermissions => {
                    // Permission storage is an external collaborator; the
                    // worker only acknowledges the nudge.
                    self.emit(WorkerEvent::RefreshRequested).await?;
                    Ok(Flow::Continue)
                }
                WorkerCommand::RefreshCredentials { payload } => {
                    if let Some(token) = payload.get("authToken").and_then(|v| v.as_str()) {
                        self.config.auth_token = Some(token.to_string());
                    }
                    self.emit(WorkerEvent::CredentialsUpdated { payload }).await?;
                    Ok(Flow::Continue)
                }
            },
            IpcPayload::StatusRequest => {
                self.send_status(correlation_id).await?;
                Ok(Flow::Continue)
            }
            IpcPayload::Event { .. } | IpcPayload::StatusResponse { .. } => {
                debug!(mesh_id = %self.config.mesh_id, "Ignoring worker-bound envelope type");
                Ok(Flow::Continue)
            }
        }
    }

    /// Wait out a reconnect delay while still serving parent commands.
    async fn wait_backoff(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<IpcEnvelope>,
        delay: Duration,
    ) -> Result<Flow> {
        debug!(
            mesh_id = %self.config.mesh_id,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(Flow::Continue),
                envelope = cmd_rx.recv() => {
                    let Some(envelope) = envelope else {
                        return Ok(Flow::Exit(1));
                    };
                    match self.handle_envelope(envelope, None).await? {
                        Flow::Exit(code) => return Ok(Flow::Exit(code)),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn send_status(&mut self, correlation_id: Option<String>) -> Result<()> {
        let status = WorkerStatus {
            state: if self.connected {
                SessionState::Connected
            } else {
                SessionState::Disconnected
            }
            .label()
            .to_string(),
            connected: self.connected,
            uptime_secs: self.started_at.elapsed().as_secs(),
            retry_count: self.retry_count,
            connection_attempts: self.connection_attempts,
            last_error: self.last_error.clone(),
        };
        self.out
            .send(&IpcEnvelope::status_response(status, correlation_id))
            .await
            .context("Failed to write status response")
    }

    async fn emit(&mut self, event: WorkerEvent) -> Result<()> {
        self.out
            .send(&IpcEnvelope::event(event))
            .await
            .context("Failed to write event to supervisor")
    }
}

/// Reads parent commands from stdin and funnels envelopes to the runtime.
fn spawn_command_reader(cmd_tx: mpsc::Sender<IpcEnvelope>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(envelope) = parse_line(&line) {
                if cmd_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn is_kick(code: Option<u16>, reason: &str) -> bool {
    if matches!(code, Some(4001) | Some(4003)) {
        return true;
    }
    let reason = reason.to_ascii_lowercase();
    reason.contains("kick") || reason.contains("ban")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        // Jitter adds at most 10%, so compare against the un-jittered floor
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(1));
        assert!(first < Duration::from_millis(1150));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_secs(2));

        // Far along the schedule the cap holds
        for _ in 0..10 {
            backoff.next_delay();
        }
        let late = backoff.next_delay();
        assert!(late <= Duration::from_secs(66));
        assert!(late >= Duration::from_secs(60));
    }

    #[test]
    fn backoff_reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(1150));
    }

    #[test]
    fn kick_detection_uses_code_and_reason() {
        assert!(is_kick(Some(4001), ""));
        assert!(is_kick(Some(4003), "whatever"));
        assert!(is_kick(None, "you were kicked by an admin"));
        assert!(is_kick(None, "Banned from mesh"));
        assert!(!is_kick(Some(1000), "normal closure"));
        assert!(!is_kick(None, "going away"));
    }
}
