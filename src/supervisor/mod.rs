//! Parent-process side of meshherd: registry, policy, discovery and health.
//!
//! All registry mutation happens on the supervisor loop in [`Supervisor::run`];
//! concurrency exists only at the granularity of pending async operations
//! (spawns, delayed respawns, persistence writes), which interleave freely.

pub mod health;
pub mod manager;
pub mod quarantine;
pub mod reconciler;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::MeshherdConfig;
use crate::directory::MeshDirectory;
use crate::protocol::{IpcPayload, WorkerCommand};

pub use health::HealthMonitor;
pub use manager::{MeshProcessManager, SupervisorMsg};
pub use quarantine::{BlockEntry, BlockReason, QuarantineStore};
pub use reconciler::{diff, ReconcileActions, Reconciler};
pub use registry::{FleetStats, ProcessRecord, ProcessRegistry, ProcessState};

/// Ties the manager, health monitor and reconciler together into the
/// single timer-driven supervisor loop.
pub struct Supervisor {
    config: Arc<MeshherdConfig>,
    manager: Arc<MeshProcessManager>,
    health: HealthMonitor,
    reconciler: Reconciler,
    quarantine: Arc<tokio::sync::Mutex<QuarantineStore>>,
    msg_rx: mpsc::Receiver<SupervisorMsg>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub async fn new(
        config: MeshherdConfig,
        directory: Arc<dyn MeshDirectory>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let config = Arc::new(config);

        let quarantine = QuarantineStore::load(
            &config.quarantine.file_path,
            chrono::Duration::seconds(config.quarantine.failure_block_secs as i64),
        )
        .await
        .context("Failed to load quarantine file")?;
        let quarantine = Arc::new(tokio::sync::Mutex::new(quarantine));

        let (msg_tx, msg_rx) = mpsc::channel(256);
        let manager = Arc::new(MeshProcessManager::new(
            Arc::clone(&config),
            Arc::clone(&directory),
            Arc::clone(&quarantine),
            msg_tx,
        ));
        let health = HealthMonitor::new(&config.health);
        let reconciler = Reconciler::new(Arc::clone(&config), directory);

        Ok(Self {
            config,
            manager,
            health,
            reconciler,
            quarantine,
            msg_rx,
            shutdown_rx,
        })
    }

    pub fn manager(&self) -> &Arc<MeshProcessManager> {
        &self.manager
    }

    /// Run until the shutdown flag flips, then stop the fleet in order.
    pub async fn run(mut self) -> Result<()> {
        let mut discovery = tokio::time::interval(Duration::from_secs(
            self.config.supervisor.discovery_interval_secs,
        ));
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut poll =
            tokio::time::interval(Duration::from_secs(self.config.health.poll_interval_secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            discovery_interval_secs = self.config.supervisor.discovery_interval_secs,
            poll_interval_secs = self.config.health.poll_interval_secs,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                // Cooperative shutdown: the flag is observed between loop
                // iterations, never mid-operation.
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                _ = discovery.tick() => {
                    self.reconciler.tick(&self.manager, &self.quarantine).await;
                }
                _ = poll.tick() => {
                    self.health.poll_tick(&self.manager).await;
                    let stats = self.manager.registry().stats();
                    debug!(
                        total = stats.total,
                        connected = stats.connected,
                        unhealthy = stats.unhealthy,
                        "Fleet stats"
                    );
                }
                Some(msg) = self.msg_rx.recv() => {
                    self.dispatch(msg).await;
                }
            }
        }

        self.stop_fleet().await;
        Ok(())
    }

    /// Route one message into the manager. Failures are contained to the
    /// mesh they concern; no error escapes the dispatch boundary.
    async fn dispatch(&self, msg: SupervisorMsg) {
        match msg {
            SupervisorMsg::Inbound { mesh_id, envelope } => match envelope.payload {
                IpcPayload::Event { event } => {
                    if let Err(e) = self.manager.handle_event(&mesh_id, event).await {
                        error!(mesh_id = %mesh_id, error = %e, "Event handling failed");
                    }
                }
                IpcPayload::StatusResponse { status } => {
                    self.health.record_status(&self.manager, &mesh_id, &status);
                }
                IpcPayload::Command { .. } | IpcPayload::StatusRequest => {
                    debug!(mesh_id = %mesh_id, "Ignoring parent-bound envelope from worker");
                }
            },
            SupervisorMsg::Exited { mesh_id, code } => {
                if let Err(e) = self.manager.handle_exit(&mesh_id, code).await {
                    error!(mesh_id = %mesh_id, error = %e, "Exit handling failed");
                }
            }
            SupervisorMsg::RespawnDue { mesh_id } => {
                if let Err(e) = self.manager.handle_respawn(&mesh_id).await {
                    error!(mesh_id = %mesh_id, error = %e, "Respawn failed");
                }
            }
        }
    }

    /// Orderly fleet stop: discovery and polling have already ceased (the
    /// loop exited), so broadcast a graceful shutdown, drain exits for the
    /// grace window, and force-kill whatever remains.
    async fn stop_fleet(mut self) {
        let live = self.manager.live_workers();
        if live == 0 {
            info!("Supervisor stopped; no workers to drain");
            return;
        }

        info!(workers = live, "Broadcasting graceful shutdown");
        self.manager
            .broadcast(WorkerCommand::Shutdown { graceful: true })
            .await;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.supervisor.stop_grace_secs);
        while self.manager.live_workers() > 0 {
            match tokio::time::timeout_at(deadline, self.msg_rx.recv()).await {
                Ok(Some(SupervisorMsg::Exited { mesh_id, code })) => {
                    if let Err(e) = self.manager.handle_exit(&mesh_id, code).await {
                        error!(mesh_id = %mesh_id, error = %e, "Exit handling failed");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let stragglers = self.manager.force_kill_all();
        if stragglers > 0 {
            warn!(count = stragglers, "Force-killed stragglers after grace window");
        }
        info!("Supervisor stopped");
    }
}
