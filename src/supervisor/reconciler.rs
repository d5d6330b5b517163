//! Level-triggered reconciliation between the authoritative mesh list and
//! the live process registry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::MeshherdConfig;
use crate::directory::{ListMode, MeshDirectory, MeshSummary};
use crate::supervisor::manager::MeshProcessManager;
use crate::supervisor::quarantine::QuarantineStore;

/// Spawn/stop actions produced by one reconciliation diff.
#[derive(Debug, Default)]
pub struct ReconcileActions {
    pub to_spawn: Vec<MeshSummary>,
    pub to_stop: Vec<String>,
}

impl ReconcileActions {
    pub fn is_empty(&self) -> bool {
        self.to_spawn.is_empty() && self.to_stop.is_empty()
    }
}

/// Pure set difference between the desired mesh list and the registry keys.
///
/// Level-triggered: the full diff is recomputed every tick, so a flap that
/// resolves between ticks is invisible and running the diff twice against
/// unchanged inputs yields no actions the second time.
pub fn diff(desired: &[MeshSummary], current: &HashSet<String>) -> ReconcileActions {
    let desired_ids: HashSet<&str> = desired.iter().map(|m| m.id.as_str()).collect();

    let to_spawn = desired
        .iter()
        .filter(|m| !current.contains(&m.id))
        .cloned()
        .collect();

    let to_stop = current
        .iter()
        .filter(|id| !desired_ids.contains(id.as_str()))
        .cloned()
        .collect();

    ReconcileActions { to_spawn, to_stop }
}

/// Periodic discovery loop driver.
pub struct Reconciler {
    config: Arc<MeshherdConfig>,
    directory: Arc<dyn MeshDirectory>,
}

impl Reconciler {
    pub fn new(config: Arc<MeshherdConfig>, directory: Arc<dyn MeshDirectory>) -> Self {
        Self { config, directory }
    }

    /// One reconciliation tick: sweep the quarantine file, fetch the
    /// authoritative list, then apply the diff. A directory fetch failure
    /// is transient: logged, and no supervisor state changes.
    pub async fn tick(
        &self,
        manager: &MeshProcessManager,
        quarantine: &Arc<tokio::sync::Mutex<QuarantineStore>>,
    ) {
        quarantine.lock().await.cleanup_expired().await;

        let service = &self.config.service;
        let desired = match self
            .directory
            .list_meshes(
                &service.owner_id,
                ListMode::from_config(&service.list_mode),
                service.list_limit,
            )
            .await
        {
            Ok(desired) => desired,
            Err(e) => {
                warn!(error = %e, "Discovery fetch failed; keeping current fleet");
                return;
            }
        };

        let current: HashSet<String> = manager.registry().mesh_ids().into_iter().collect();
        let actions = diff(&desired, &current);
        if actions.is_empty() {
            debug!(fleet = current.len(), "Reconciliation: fleet in sync");
            return;
        }

        info!(
            desired = desired.len(),
            running = current.len(),
            spawning = actions.to_spawn.len(),
            stopping = actions.to_stop.len(),
            "Reconciling fleet"
        );

        // Spawns are spaced out to avoid hammering the mesh service with a
        // burst of simultaneous connections.
        let spawn_delay = Duration::from_millis(self.config.supervisor.spawn_delay_ms);
        for (i, mesh) in actions.to_spawn.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(spawn_delay).await;
            }
            match manager.spawn_for(mesh).await {
                Ok(true) => {}
                Ok(false) => debug!(mesh_id = %mesh.id, "Spawn refused"),
                Err(e) => warn!(mesh_id = %mesh.id, error = %e, "Spawn failed"),
            }
        }

        for mesh_id in &actions.to_stop {
            info!(mesh_id = %mesh_id, "Mesh no longer listed; stopping worker");
            manager.stop_worker(mesh_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summaries(ids: &[&str]) -> Vec<MeshSummary> {
        ids.iter()
            .map(|id| MeshSummary {
                id: id.to_string(),
                metadata: serde_json::Value::Null,
            })
            .collect()
    }

    fn current(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn diff_spawns_additions_and_stops_removals() {
        let actions = diff(&summaries(&["a", "b", "c"]), &current(&["b", "d"]));
        let spawn_ids: Vec<&str> = actions.to_spawn.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(spawn_ids.len(), 2);
        assert!(spawn_ids.contains(&"a"));
        assert!(spawn_ids.contains(&"c"));
        assert_eq!(actions.to_stop, vec!["d".to_string()]);
    }

    #[test]
    fn diff_is_idempotent_when_fleet_matches() {
        let desired = summaries(&["a", "b"]);
        let first = diff(&desired, &current(&[]));
        assert_eq!(first.to_spawn.len(), 2);

        // After applying the first run, a second run yields no actions
        let after: HashSet<String> = first.to_spawn.iter().map(|m| m.id.clone()).collect();
        let second = diff(&desired, &after);
        assert!(second.is_empty());
    }

    #[test]
    fn diff_of_empty_inputs_is_empty() {
        assert!(diff(&[], &current(&[])).is_empty());
    }
}
