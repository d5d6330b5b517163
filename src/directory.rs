//! Mesh directory collaborator.
//!
//! The directory service is external to the core: the supervisor only ever
//! enumerates meshes for discovery and resolves a mesh's socket endpoint
//! before spawning a worker. Everything else about the REST API lives on
//! the other side of this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mesh {mesh_id} has no resolvable endpoint")]
    NoEndpoint { mesh_id: String },

    #[error("unexpected directory response: {reason}")]
    BadResponse { reason: String },
}

/// Mesh selection mode for discovery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Joined,
    Owned,
    All,
}

impl ListMode {
    pub fn from_config(value: &str) -> Self {
        match value {
            "owned" => ListMode::Owned,
            "all" => ListMode::All,
            _ => ListMode::Joined,
        }
    }

    fn as_query(&self) -> &'static str {
        match self {
            ListMode::Joined => "joined",
            ListMode::Owned => "owned",
            ListMode::All => "all",
        }
    }
}

/// One row of a discovery listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshSummary {
    pub id: String,
    /// Opaque service metadata, kept verbatim for the process record
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Full description of one mesh, used at spawn time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshDetails {
    pub id: String,
    /// WebSocket endpoint workers connect to; absent when the mesh is closed
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[async_trait]
pub trait MeshDirectory: Send + Sync {
    async fn list_meshes(
        &self,
        owner_id: &str,
        mode: ListMode,
        limit: usize,
    ) -> Result<Vec<MeshSummary>, DirectoryError>;

    async fn describe_mesh(&self, mesh_id: &str) -> Result<MeshDetails, DirectoryError>;
}

/// REST implementation against the mesh service.
pub struct HttpMeshDirectory {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpMeshDirectory {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url.trim_end_matches('/'), path));
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        request
    }
}

#[async_trait]
impl MeshDirectory for HttpMeshDirectory {
    async fn list_meshes(
        &self,
        owner_id: &str,
        mode: ListMode,
        limit: usize,
    ) -> Result<Vec<MeshSummary>, DirectoryError> {
        let response = self
            .get("meshes")
            .query(&[
                ("owner", owner_id.to_string()),
                ("mode", mode.as_query().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let meshes: Vec<MeshSummary> = response.json().await?;
        Ok(meshes)
    }

    async fn describe_mesh(&self, mesh_id: &str) -> Result<MeshDetails, DirectoryError> {
        let response = self
            .get(&format!("meshes/{mesh_id}"))
            .send()
            .await?
            .error_for_status()?;

        let details: MeshDetails = response.json().await?;
        if details.id != mesh_id {
            return Err(DirectoryError::BadResponse {
                reason: format!("asked for {mesh_id}, got {}", details.id),
            });
        }
        Ok(details)
    }
}

/// In-memory directory used by tests and by the dry-run status command.
#[derive(Default)]
pub struct StaticMeshDirectory {
    meshes: std::sync::Mutex<Vec<MeshDetails>>,
}

impl StaticMeshDirectory {
    pub fn new(meshes: Vec<MeshDetails>) -> Self {
        Self {
            meshes: std::sync::Mutex::new(meshes),
        }
    }

    pub fn set_meshes(&self, meshes: Vec<MeshDetails>) {
        *self.meshes.lock().unwrap() = meshes;
    }
}

#[async_trait]
impl MeshDirectory for StaticMeshDirectory {
    async fn list_meshes(
        &self,
        _owner_id: &str,
        _mode: ListMode,
        limit: usize,
    ) -> Result<Vec<MeshSummary>, DirectoryError> {
        let meshes = self.meshes.lock().unwrap();
        Ok(meshes
            .iter()
            .take(limit)
            .map(|m| MeshSummary {
                id: m.id.clone(),
                metadata: serde_json::Value::Null,
            })
            .collect())
    }

    async fn describe_mesh(&self, mesh_id: &str) -> Result<MeshDetails, DirectoryError> {
        let meshes = self.meshes.lock().unwrap();
        meshes
            .iter()
            .find(|m| m.id == mesh_id)
            .cloned()
            .ok_or_else(|| DirectoryError::BadResponse {
                reason: format!("unknown mesh {mesh_id}"),
            })
    }
}
