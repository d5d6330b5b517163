use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Minimum restart budget enforced regardless of configured value.
pub const MIN_PROCESS_RESTARTS: u32 = 3;

/// Main configuration structure for meshherd
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeshherdConfig {
    /// Mesh service connection settings
    pub service: ServiceConfig,
    /// Process supervisor settings
    pub supervisor: SupervisorConfig,
    /// Worker health monitoring settings
    pub health: HealthConfig,
    /// Quarantine/blocklist settings
    pub quarantine: QuarantineConfig,
    /// Per-worker connection session settings
    pub session: SessionConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Base URL of the mesh directory REST API
    pub api_base_url: String,
    /// Bearer token for the directory and the mesh sockets (env var wins)
    pub auth_token: Option<String>,
    /// Device identifier presented to the service; defaults to the hostname
    pub device_id: Option<String>,
    /// Peer identifier the workers join meshes as
    pub peer_id: String,
    /// Owner whose meshes the discovery loop enumerates
    pub owner_id: String,
    /// Mesh selection mode: "joined", "owned" or "all"
    pub list_mode: String,
    /// Maximum meshes fetched per discovery tick
    pub list_limit: usize,
    /// Chat command prefixes handed to each worker
    pub command_prefixes: Vec<String>,
    /// Enable worker debug behavior
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Seconds between discovery/reconciliation ticks
    pub discovery_interval_secs: u64,
    /// Milliseconds between consecutive spawns within one tick
    pub spawn_delay_ms: u64,
    /// Connection failures tolerated before a mesh is quarantined
    pub max_connection_attempts: u32,
    /// Worker respawns allowed before permanent removal (floor of 3)
    pub max_process_restarts: u32,
    /// Seconds to wait before respawning an exited worker
    pub restart_delay_secs: u64,
    /// Seconds granted to a worker between graceful command and force kill
    pub stop_grace_secs: u64,
    /// Close reasons treated as a remote-initiated mesh shutdown
    pub remote_close_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Seconds between heartbeat poll ticks
    pub poll_interval_secs: u64,
    /// Seconds without a heartbeat before a worker counts as stale
    pub staleness_threshold_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuarantineConfig {
    /// Path of the persisted blocklist file
    pub file_path: String,
    /// TTL in seconds for connection-failure blocks
    pub failure_block_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Seconds between keepalive pings (first ping after one full interval)
    pub keepalive_interval_secs: u64,
    /// Seconds a correlated request waits before resolving to no-response
    pub request_timeout_secs: u64,
    /// Consecutive ping failures that force a reconnect
    pub ping_failure_limit: u32,
    /// Base delay in milliseconds for the worker's reconnect backoff
    pub reconnect_base_ms: u64,
    /// Cap in seconds for the worker's reconnect backoff
    pub reconnect_cap_secs: u64,
    /// Connect-to-close gap in seconds below which a close counts as an
    /// immediate rejection
    pub immediate_close_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level directive when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of the human format
    pub json_logs: bool,
}

impl Default for MeshherdConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                api_base_url: "https://api.mesh.example.com/v1".to_string(),
                auth_token: None, // read from env at load time
                device_id: None,  // falls back to hostname
                peer_id: "meshherd-bot".to_string(),
                owner_id: String::new(),
                list_mode: "joined".to_string(),
                list_limit: 100,
                command_prefixes: vec!["!".to_string(), "/".to_string()],
                debug: false,
            },
            supervisor: SupervisorConfig {
                discovery_interval_secs: 300,
                spawn_delay_ms: 500,
                max_connection_attempts: 3,
                max_process_restarts: 5,
                restart_delay_secs: 5,
                stop_grace_secs: 10,
                remote_close_markers: vec![
                    "mesh closed".to_string(),
                    "room closed".to_string(),
                    "server disconnect".to_string(),
                ],
            },
            health: HealthConfig {
                poll_interval_secs: 30,
                staleness_threshold_secs: 60,
            },
            quarantine: QuarantineConfig {
                file_path: ".meshherd/blocked-meshes.json".to_string(),
                failure_block_secs: 3600, // 1 hour
            },
            session: SessionConfig {
                keepalive_interval_secs: 6,
                request_timeout_secs: 8,
                ping_failure_limit: 3,
                reconnect_base_ms: 1000,
                reconnect_cap_secs: 60,
                immediate_close_secs: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
        }
    }
}

impl MeshherdConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (meshherd.toml)
    /// 3. Environment variables (prefixed with MESHHERD_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&MeshherdConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("meshherd.toml").exists() {
            builder = builder.add_source(File::with_name("meshherd"));
        }

        builder = builder.add_source(
            Environment::with_prefix("MESHHERD")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut loaded: MeshherdConfig = config.try_deserialize()?;

        // Token can also arrive via the service's conventional env var
        if loaded.service.auth_token.is_none() {
            if let Ok(token) = std::env::var("MESH_AUTH_TOKEN") {
                loaded.service.auth_token = Some(token);
            }
        }

        loaded.normalize();
        Ok(loaded)
    }

    /// Clamp tunables to their enforced bounds.
    pub fn normalize(&mut self) {
        if self.supervisor.max_process_restarts < MIN_PROCESS_RESTARTS {
            self.supervisor.max_process_restarts = MIN_PROCESS_RESTARTS;
        }
        if self.supervisor.max_connection_attempts == 0 {
            self.supervisor.max_connection_attempts = 1;
        }
    }

    /// Device identifier, falling back to the machine hostname.
    pub fn device_id(&self) -> String {
        self.service
            .device_id
            .clone()
            .or_else(|| {
                hostname::get()
                    .ok()
                    .map(|h| h.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "meshherd".to_string())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<MeshherdConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = MeshherdConfig::load_env_file();
        MeshherdConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static MeshherdConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let cfg = MeshherdConfig::default();
        assert_eq!(cfg.supervisor.max_connection_attempts, 3);
        assert_eq!(cfg.supervisor.max_process_restarts, 5);
        assert_eq!(cfg.supervisor.spawn_delay_ms, 500);
        assert_eq!(cfg.supervisor.stop_grace_secs, 10);
        assert_eq!(cfg.health.poll_interval_secs, 30);
        assert_eq!(cfg.health.staleness_threshold_secs, 60);
        assert_eq!(cfg.quarantine.failure_block_secs, 3600);
        assert_eq!(cfg.session.keepalive_interval_secs, 6);
        assert_eq!(cfg.session.request_timeout_secs, 8);
        assert_eq!(cfg.session.immediate_close_secs, 5);
    }

    #[test]
    fn restart_budget_floor_is_enforced() {
        let mut cfg = MeshherdConfig::default();
        cfg.supervisor.max_process_restarts = 1;
        cfg.normalize();
        assert_eq!(cfg.supervisor.max_process_restarts, MIN_PROCESS_RESTARTS);

        // Values above the floor pass through untouched
        cfg.supervisor.max_process_restarts = 7;
        cfg.normalize();
        assert_eq!(cfg.supervisor.max_process_restarts, 7);
    }
}
