//! Quarantine store: temporary and permanent mesh exclusion, persisted to a
//! JSON file so blocks survive supervisor restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a mesh was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ConnectionFailures,
    Kicked,
}

/// One blocklist entry. `blocked_until: None` means permanent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEntry {
    pub mesh_id: String,
    pub reason: BlockReason,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl BlockEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => false,
        }
    }
}

/// On-disk layout of the quarantine file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockFile {
    blocked_meshes: HashMap<String, BlockEntry>,
}

/// In-memory blocklist backed by a pretty-printed JSON file.
///
/// Every mutation rewrites the whole entry set through a temp file and an
/// atomic rename, so a crash mid-write cannot corrupt existing data.
/// Persistence failures after load are logged and the store degrades to
/// in-memory-only rather than taking the supervisor down.
pub struct QuarantineStore {
    path: PathBuf,
    default_ttl: Duration,
    entries: HashMap<String, BlockEntry>,
}

impl QuarantineStore {
    /// Load the store from disk. A missing file is a fresh start; any other
    /// I/O or parse failure surfaces to the caller.
    pub async fn load(path: impl Into<PathBuf>, default_ttl: Duration) -> Result<Self, QuarantineError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let file: BlockFile = serde_json::from_str(&contents)?;
                file.blocked_meshes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        if !entries.is_empty() {
            info!(blocked = entries.len(), path = %path.display(), "Loaded quarantine file");
        }

        Ok(Self {
            path,
            default_ttl,
            entries,
        })
    }

    /// Upsert a block entry and persist.
    ///
    /// `connection_failures` blocks default to the configured TTL;
    /// `kicked` blocks are always permanent regardless of `duration`.
    pub async fn block(&mut self, mesh_id: &str, reason: BlockReason, duration: Option<Duration>) {
        let now = Utc::now();
        let blocked_until = match reason {
            BlockReason::Kicked => None,
            BlockReason::ConnectionFailures => Some(now + duration.unwrap_or(self.default_ttl)),
        };

        let entry = BlockEntry {
            mesh_id: mesh_id.to_string(),
            reason,
            blocked_at: now,
            blocked_until,
        };

        info!(
            mesh_id = %mesh_id,
            reason = ?reason,
            blocked_until = ?entry.blocked_until,
            "Quarantining mesh"
        );

        self.entries.insert(mesh_id.to_string(), entry);
        self.persist().await;
    }

    /// Check whether a mesh is currently blocked.
    ///
    /// Expired TTL entries are deleted on the spot (persisting the deletion)
    /// and report unblocked, so the list self-heals without waiting for the
    /// periodic sweep. Permanent entries never expire.
    pub async fn is_blocked(&mut self, mesh_id: &str) -> bool {
        let expired = match self.entries.get(mesh_id) {
            None => return false,
            Some(entry) => entry.is_expired(Utc::now()),
        };

        if expired {
            debug!(mesh_id = %mesh_id, "Quarantine entry expired, removing");
            self.entries.remove(mesh_id);
            self.persist().await;
            return false;
        }
        true
    }

    /// Sweep out every expired entry. Invoked once per reconciliation tick
    /// to bound staleness of the on-disk file even absent lookups.
    pub async fn cleanup_expired(&mut self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        for id in &expired {
            self.entries.remove(id);
        }
        info!(removed = expired.len(), "Swept expired quarantine entries");
        self.persist().await;
        expired.len()
    }

    /// Explicitly unblock one mesh. Returns whether an entry existed.
    pub async fn unblock(&mut self, mesh_id: &str) -> bool {
        if self.entries.remove(mesh_id).is_some() {
            info!(mesh_id = %mesh_id, "Unblocked mesh");
            self.persist().await;
            true
        } else {
            false
        }
    }

    pub fn get(&self, mesh_id: &str) -> Option<&BlockEntry> {
        self.entries.get(mesh_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &BlockEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full entry set to disk: temp file, then rename over the
    /// real one. Failure is logged, not fatal; the in-memory state stays
    /// authoritative for this process.
    async fn persist(&self) {
        if let Err(e) = self.try_persist().await {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to persist quarantine file, continuing in-memory"
            );
        }
    }

    async fn try_persist(&self) -> Result<(), QuarantineError> {
        let file = BlockFile {
            blocked_meshes: self.entries.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
