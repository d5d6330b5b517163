//! Mesh worker process management: spawn, stop, restart and command
//! delivery, with quarantine policy applied at every decision point.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MeshherdConfig;
use crate::directory::{MeshDirectory, MeshSummary};
use crate::protocol::{parse_line, IpcEnvelope, IpcWriter, WorkerCommand, WorkerEvent};
use crate::supervisor::quarantine::{BlockReason, QuarantineStore};
use crate::supervisor::registry::{ProcessRecord, ProcessRegistry, ProcessState};
use crate::worker::MeshWorkerConfig;

/// Messages funneled into the supervisor loop from per-worker tasks.
#[derive(Debug)]
pub enum SupervisorMsg {
    /// A protocol envelope arrived on a worker's stdout.
    Inbound {
        mesh_id: String,
        envelope: IpcEnvelope,
    },
    /// A worker process exited.
    Exited {
        mesh_id: String,
        code: Option<i32>,
    },
    /// A scheduled restart delay elapsed.
    RespawnDue { mesh_id: String },
}

/// Live OS-process side of a registry record.
struct WorkerHandle {
    pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<IpcWriter<ChildStdin>>>,
}

/// Owns the process registry and every worker's OS handle.
///
/// All mutation funnels through the supervisor loop; the async operations
/// this type spawns (exit watchers, delayed respawns, grace-kill backstops)
/// only ever report back through the message channel.
pub struct MeshProcessManager {
    config: Arc<MeshherdConfig>,
    registry: ProcessRegistry,
    handles: Arc<Mutex<HashMap<String, WorkerHandle>>>,
    quarantine: Arc<tokio::sync::Mutex<QuarantineStore>>,
    directory: Arc<dyn MeshDirectory>,
    msg_tx: mpsc::Sender<SupervisorMsg>,
}

impl MeshProcessManager {
    pub fn new(
        config: Arc<MeshherdConfig>,
        directory: Arc<dyn MeshDirectory>,
        quarantine: Arc<tokio::sync::Mutex<QuarantineStore>>,
        msg_tx: mpsc::Sender<SupervisorMsg>,
    ) -> Self {
        Self {
            config,
            registry: ProcessRegistry::new(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            quarantine,
            directory,
            msg_tx,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn live_workers(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Spawn a worker for one mesh. Returns `Ok(false)` when the spawn was
    /// refused (already supervised, quarantined, or no resolvable endpoint)
    /// and `Ok(true)` when a process was created.
    pub async fn spawn_for(&self, mesh: &MeshSummary) -> Result<bool> {
        if self.registry.contains(&mesh.id) {
            return Ok(false);
        }
        if self.quarantine.lock().await.is_blocked(&mesh.id).await {
            debug!(mesh_id = %mesh.id, "Mesh is quarantined; refusing spawn");
            return Ok(false);
        }

        // Resolve the socket endpoint before forking; no endpoint, no process.
        let details = self.directory.describe_mesh(&mesh.id).await?;
        let endpoint = match details.endpoint.filter(|e| !e.is_empty()) {
            Some(endpoint) => endpoint,
            None => {
                warn!(mesh_id = %mesh.id, "Mesh has no resolvable endpoint; skipping spawn");
                return Ok(false);
            }
        };

        let worker_config = self.build_worker_config(&mesh.id, endpoint);
        let record = ProcessRecord::new(mesh.id.clone(), mesh.metadata.clone(), worker_config.clone());

        // Reserve the registry slot before the fork: at most one process per
        // mesh, even with concurrent spawn calls in flight.
        if !self.registry.try_reserve(record) {
            return Ok(false);
        }

        if let Err(e) = self.fork_worker(&mesh.id, &worker_config).await {
            self.registry.remove(&mesh.id);
            return Err(e);
        }
        Ok(true)
    }

    fn build_worker_config(&self, mesh_id: &str, endpoint: String) -> MeshWorkerConfig {
        let service = &self.config.service;
        MeshWorkerConfig {
            mesh_id: mesh_id.to_string(),
            endpoint,
            auth_token: service.auth_token.clone(),
            device_id: self.config.device_id(),
            peer_id: service.peer_id.clone(),
            command_prefixes: service.command_prefixes.clone(),
            debug: service.debug,
        }
    }

    /// Fork the worker process and wire its IPC tasks.
    async fn fork_worker(&self, mesh_id: &str, worker_config: &MeshWorkerConfig) -> Result<()> {
        let exe = std::env::current_exe().context("Failed to resolve current executable")?;
        let config_json =
            serde_json::to_string(worker_config).context("Failed to encode worker config")?;

        let mut child = Command::new(&exe)
            .arg("worker")
            .arg("--config")
            .arg(&config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker for {mesh_id}"))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .context("Worker stdin pipe unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("Worker stdout pipe unavailable")?;
        let stderr = child
            .stderr
            .take()
            .context("Worker stderr pipe unavailable")?;

        self.registry.with_record(mesh_id, |r| {
            r.pid = pid;
            r.started_at = Utc::now();
            r.last_heartbeat = Utc::now();
        });
        self.handles.lock().unwrap().insert(
            mesh_id.to_string(),
            WorkerHandle {
                pid,
                stdin: Arc::new(tokio::sync::Mutex::new(IpcWriter::new(stdin))),
            },
        );

        // stdout: protocol envelopes, plus whatever the worker prints.
        // Non-protocol lines pass through to the log, never to the parser.
        let tx = self.msg_tx.clone();
        let id = mesh_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_line(&line) {
                    Some(envelope) => {
                        if tx
                            .send(SupervisorMsg::Inbound {
                                mesh_id: id.clone(),
                                envelope,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => {
                        if !line.trim().is_empty() {
                            debug!(mesh_id = %id, output = %line, "Worker output");
                        }
                    }
                }
            }
        });

        let id = mesh_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(mesh_id = %id, stderr = %line, "Worker log");
            }
        });

        let tx = self.msg_tx.clone();
        let id = mesh_id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.ok().and_then(|s| s.code());
            let _ = tx.send(SupervisorMsg::Exited { mesh_id: id, code }).await;
        });

        info!(mesh_id = %mesh_id, pid = ?pid, "Spawned mesh worker");
        Ok(())
    }

    /// Apply one worker lifecycle event to the registry and policy.
    pub async fn handle_event(&self, mesh_id: &str, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Ready => {
                self.registry.with_record(mesh_id, |r| {
                    if matches!(r.state, ProcessState::Spawning | ProcessState::Restarting) {
                        r.state = ProcessState::Ready;
                    }
                    r.last_heartbeat = Utc::now();
                });
                info!(mesh_id = %mesh_id, "Worker ready");
            }
            WorkerEvent::Connected => {
                self.registry.with_record(mesh_id, |r| {
                    r.state = ProcessState::Connected;
                    r.connection_attempts = 0;
                    r.last_heartbeat = Utc::now();
                });
                info!(mesh_id = %mesh_id, "Worker connected to mesh");
            }
            WorkerEvent::Disconnected { reason } => {
                if self.is_remote_close(&reason) {
                    // The mesh itself went away; there is nothing to
                    // reconnect to and no restart is warranted.
                    self.registry.with_record(mesh_id, |r| {
                        r.state = ProcessState::Stopped;
                        r.server_disconnected = true;
                    });
                    info!(mesh_id = %mesh_id, reason = %reason, "Mesh closed remotely; stopping worker");
                    if let Err(e) = self
                        .send_command(mesh_id, WorkerCommand::Shutdown { graceful: true })
                        .await
                    {
                        debug!(mesh_id = %mesh_id, error = %e, "Shutdown command not delivered");
                    }
                } else {
                    self.registry.with_record(mesh_id, |r| {
                        r.state = ProcessState::Disconnected;
                        r.last_heartbeat = Utc::now();
                    });
                    info!(mesh_id = %mesh_id, reason = %reason, "Worker disconnected");
                }
            }
            WorkerEvent::Kicked => {
                self.registry.with_record(mesh_id, |r| {
                    r.kicked = true;
                    r.state = ProcessState::Stopped;
                });
                self.quarantine
                    .lock()
                    .await
                    .block(mesh_id, BlockReason::Kicked, None)
                    .await;
                warn!(mesh_id = %mesh_id, "Worker kicked from mesh; permanently blocked");
            }
            WorkerEvent::ConnectionFailed { attempt } => {
                let attempts = self
                    .registry
                    .with_record(mesh_id, |r| {
                        r.connection_attempts += 1;
                        r.last_heartbeat = Utc::now();
                        r.connection_attempts
                    })
                    .unwrap_or(0);
                debug!(
                    mesh_id = %mesh_id,
                    worker_attempt = attempt,
                    connection_attempts = attempts,
                    "Worker connection attempt failed"
                );
                if attempts >= self.config.supervisor.max_connection_attempts {
                    self.registry
                        .with_record(mesh_id, |r| r.state = ProcessState::Blocked);
                    self.quarantine
                        .lock()
                        .await
                        .block(mesh_id, BlockReason::ConnectionFailures, None)
                        .await;
                    warn!(
                        mesh_id = %mesh_id,
                        attempts,
                        "Connection attempts exhausted; mesh quarantined"
                    );
                    self.stop_worker(mesh_id).await;
                }
            }
            WorkerEvent::Error { message } => {
                self.registry
                    .with_record(mesh_id, |r| r.last_error = Some(message.clone()));
                warn!(mesh_id = %mesh_id, error = %message, "Worker reported error");
            }
            WorkerEvent::IntentionalLeave => {
                self.registry
                    .with_record(mesh_id, |r| r.state = ProcessState::Stopped);
                info!(mesh_id = %mesh_id, "Worker left mesh intentionally");
            }
            WorkerEvent::CredentialsUpdated { .. } => {
                debug!(mesh_id = %mesh_id, "Worker acknowledged credential refresh");
            }
            WorkerEvent::RefreshRequested => {
                debug!(mesh_id = %mesh_id, "Worker requested a permissions refresh");
            }
        }
        Ok(())
    }

    fn is_remote_close(&self, reason: &str) -> bool {
        let reason = reason.to_ascii_lowercase();
        self.config
            .supervisor
            .remote_close_markers
            .iter()
            .any(|marker| reason.contains(&marker.to_ascii_lowercase()))
    }

    /// Two-phase stop: graceful shutdown command, then a timed force-kill
    /// backstop so shutdown always makes forward progress.
    pub async fn stop_worker(&self, mesh_id: &str) {
        self.registry.with_record(mesh_id, |r| {
            if !r.state.is_terminal() {
                r.state = ProcessState::Stopped;
            }
        });

        if let Err(e) = self
            .send_command(mesh_id, WorkerCommand::Shutdown { graceful: true })
            .await
        {
            debug!(mesh_id = %mesh_id, error = %e, "Graceful shutdown not delivered; killing");
            self.force_kill(mesh_id);
            return;
        }

        let handles = Arc::clone(&self.handles);
        let id = mesh_id.to_string();
        let grace = Duration::from_secs(self.config.supervisor.stop_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let pid = handles.lock().unwrap().get(&id).and_then(|h| h.pid);
            if let Some(pid) = pid {
                warn!(mesh_id = %id, pid, "Stop grace expired; force killing");
                kill_pid(pid);
            }
        });
    }

    /// Best-effort immediate kill. Failure is logged, not fatal; the exit
    /// watcher reports the actual termination whenever it lands.
    pub fn force_kill(&self, mesh_id: &str) {
        let pid = self.handles.lock().unwrap().get(mesh_id).and_then(|h| h.pid);
        match pid {
            Some(pid) => {
                info!(mesh_id = %mesh_id, pid, "Force killing worker");
                kill_pid(pid);
            }
            None => debug!(mesh_id = %mesh_id, "No live process to kill"),
        }
    }

    /// Kill every remaining worker process. Returns how many were signaled.
    pub fn force_kill_all(&self) -> usize {
        let pids: Vec<(String, u32)> = self
            .handles
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, h)| h.pid.map(|pid| (id.clone(), pid)))
            .collect();
        for (mesh_id, pid) in &pids {
            warn!(mesh_id = %mesh_id, pid, "Force killing straggler");
            kill_pid(*pid);
        }
        pids.len()
    }

    /// Process-exit policy: final states and remote disconnects remove the
    /// record; anything else gets a bounded, delayed restart.
    pub async fn handle_exit(&self, mesh_id: &str, code: Option<i32>) -> Result<()> {
        self.handles.lock().unwrap().remove(mesh_id);

        let Some(record) = self.registry.get(mesh_id) else {
            return Ok(());
        };

        if record.exit_is_final() {
            self.registry.remove(mesh_id);
            info!(
                mesh_id = %mesh_id,
                code = ?code,
                state = %record.state,
                "Worker exited; removed from registry"
            );
            return Ok(());
        }

        self.schedule_restart_or_remove(mesh_id, code).await;
        Ok(())
    }

    async fn schedule_restart_or_remove(&self, mesh_id: &str, code: Option<i32>) {
        let max_restarts = self.config.supervisor.max_process_restarts;
        let retry = self.registry.with_record(mesh_id, |r| {
            if r.retry_count < max_restarts {
                r.retry_count += 1;
                r.state = ProcessState::Restarting;
                Some(r.retry_count)
            } else {
                r.state = ProcessState::Failed;
                None
            }
        });

        match retry {
            Some(Some(retry)) => {
                let delay = Duration::from_secs(self.config.supervisor.restart_delay_secs);
                warn!(
                    mesh_id = %mesh_id,
                    code = ?code,
                    retry,
                    max_restarts,
                    delay_secs = delay.as_secs(),
                    "Worker exited unexpectedly; restart scheduled"
                );
                let tx = self.msg_tx.clone();
                let id = mesh_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SupervisorMsg::RespawnDue { mesh_id: id }).await;
                });
            }
            Some(None) => {
                self.registry.remove(mesh_id);
                error!(
                    mesh_id = %mesh_id,
                    code = ?code,
                    max_restarts,
                    "Worker exhausted its restart budget; permanently removed"
                );
            }
            None => {}
        }
    }

    /// A scheduled restart delay elapsed: respawn with the original config.
    pub async fn handle_respawn(&self, mesh_id: &str) -> Result<()> {
        let Some(record) = self.registry.get(mesh_id) else {
            return Ok(());
        };
        if record.state != ProcessState::Restarting {
            debug!(mesh_id = %mesh_id, state = %record.state, "Respawn superseded; skipping");
            return Ok(());
        }
        if self.quarantine.lock().await.is_blocked(mesh_id).await {
            self.registry.remove(mesh_id);
            info!(mesh_id = %mesh_id, "Mesh quarantined while awaiting restart; dropped");
            return Ok(());
        }

        self.registry
            .with_record(mesh_id, |r| r.state = ProcessState::Spawning);
        if let Err(e) = self.fork_worker(mesh_id, &record.config).await {
            warn!(mesh_id = %mesh_id, error = %e, "Respawn failed");
            self.schedule_restart_or_remove(mesh_id, None).await;
        }
        Ok(())
    }

    pub async fn send_command(&self, mesh_id: &str, command: WorkerCommand) -> Result<()> {
        self.send_envelope(mesh_id, &IpcEnvelope::command(command))
            .await
    }

    pub async fn send_envelope(&self, mesh_id: &str, envelope: &IpcEnvelope) -> Result<()> {
        let stdin = self
            .handles
            .lock()
            .unwrap()
            .get(mesh_id)
            .map(|h| Arc::clone(&h.stdin))
            .with_context(|| format!("No live worker for mesh {mesh_id}"))?;

        let mut writer = stdin.lock().await;
        writer
            .send(envelope)
            .await
            .with_context(|| format!("Failed to deliver envelope to {mesh_id}"))
    }

    /// Fan a command out to every live worker. One failed delivery never
    /// aborts delivery to the rest.
    pub async fn broadcast(&self, command: WorkerCommand) {
        let mesh_ids: Vec<String> = self.handles.lock().unwrap().keys().cloned().collect();
        debug!(workers = mesh_ids.len(), command = ?command, "Broadcasting command");
        for mesh_id in mesh_ids {
            if let Err(e) = self.send_command(&mesh_id, command.clone()).await {
                warn!(mesh_id = %mesh_id, error = %e, "Broadcast delivery failed");
            }
        }
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    let result = std::process::Command::new("kill")
        .arg("-KILL")
        .arg(pid.to_string())
        .output();
    if let Err(e) = result {
        warn!(pid, error = %e, "Failed to signal process");
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    // kill_on_drop covers non-unix targets
    debug!(pid, "Relying on kill_on_drop for termination");
}
