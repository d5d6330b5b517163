//! Worker-process side of meshherd: one isolated process per mesh, owning
//! exactly one connection session and speaking the control protocol with
//! the supervisor over stdin/stdout.

pub mod runtime;
pub mod session;

use serde::{Deserialize, Serialize};

/// Immutable per-mesh worker configuration.
///
/// Built by the supervisor when it decides to spawn, serialized as JSON and
/// passed to the worker process as a single argument. Owned exclusively by
/// the worker it configures; the supervisor keeps a copy only to respawn
/// with identical settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshWorkerConfig {
    pub mesh_id: String,
    /// WebSocket endpoint resolved from the directory at spawn time
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub device_id: String,
    pub peer_id: String,
    #[serde(default)]
    pub command_prefixes: Vec<String>,
    #[serde(default)]
    pub debug: bool,
}
