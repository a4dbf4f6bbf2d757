use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DeckhandError, Result};
use crate::models::{Deployment, DeploymentStatus};

/// Record filter for [`Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub owner: Option<String>,
    pub status: Option<DeploymentStatus>,
}

impl DeploymentFilter {
    pub fn matches(&self, deployment: &Deployment) -> bool {
        if let Some(owner) = &self.owner {
            if &deployment.owner != owner {
                return false;
            }
        }
        if let Some(status) = self.status {
            if deployment.status != status {
                return false;
            }
        }
        true
    }
}

/// Durable deployment record store. `put` is atomic per record; the core
/// never relies on multi-record transactions.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, id: &str) -> Result<Deployment>;
    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>>;
    async fn put(&self, deployment: &Deployment) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// One JSON file per deployment; writes land in a temp file first and are
/// renamed into place, so readers never see a partial record.
pub struct FileRegistry {
    dir: PathBuf,
}

impl FileRegistry {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn get(&self, id: &str) -> Result<Deployment> {
        let path = self.record_path(id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeckhandError::NotFound(id.to_string()))
            }
            Err(e) => return Err(DeckhandError::State(format!("failed to read record: {e}"))),
        };
        Ok(serde_json::from_str(&json)?)
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let mut deployments = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(deployments),
            Err(e) => return Err(DeckhandError::State(format!("failed to list records: {e}"))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeckhandError::State(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| DeckhandError::State(format!("failed to read record: {e}")))?;
            let deployment: Deployment = serde_json::from_str(&json)?;
            if filter.matches(&deployment) {
                deployments.push(deployment);
            }
        }
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    async fn put(&self, deployment: &Deployment) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to create registry dir: {e}")))?;
        let path = self.record_path(&deployment.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(deployment)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to write record: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to commit record: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeckhandError::State(format!("failed to delete record: {e}"))),
        }
    }
}

/// In-memory registry for tests and embedding.
#[derive(Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, Deployment>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, id: &str) -> Result<Deployment> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DeckhandError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        let records = self.records.read().await;
        let mut deployments: Vec<Deployment> =
            records.values().filter(|d| filter.matches(d)).cloned().collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deployments)
    }

    async fn put(&self, deployment: &Deployment) -> Result<()> {
        self.records
            .write()
            .await
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}
