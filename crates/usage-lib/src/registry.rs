//! Source of users and their registered clusters

use crate::models::{Cluster, User};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Enumerates users and, per user, their clusters
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn list_users(&self) -> Result<Vec<User>>;

    async fn list_clusters(&self, user_id: i64) -> Result<Vec<Cluster>>;
}

/// A user together with the clusters they registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClusters {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
}

/// Full registry contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub users: Vec<UserClusters>,
}

impl RegistrySnapshot {
    fn users(&self) -> Vec<User> {
        self.users.iter().map(|u| u.user.clone()).collect()
    }

    fn clusters_of(&self, user_id: i64) -> Vec<Cluster> {
        self.users
            .iter()
            .filter(|u| u.user.id == user_id)
            .flat_map(|u| u.clusters.iter().cloned())
            .collect()
    }

    pub fn cluster_count(&self) -> usize {
        self.users.iter().map(|u| u.clusters.len()).sum()
    }
}

/// Registry with a fixed, in-memory topology
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    snapshot: RegistrySnapshot,
}

impl StaticRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl ClusterRegistry for StaticRegistry {
    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.snapshot.users())
    }

    async fn list_clusters(&self, user_id: i64) -> Result<Vec<Cluster>> {
        Ok(self.snapshot.clusters_of(user_id))
    }
}

/// Registry read from a JSON document on disk.
///
/// The file is re-read on every [`list_users`](ClusterRegistry::list_users)
/// call, so clusters added or removed between ticks are picked up without a
/// restart. Cluster lookups use the snapshot taken by the latest user listing.
pub struct FileRegistry {
    path: PathBuf,
    snapshot: RwLock<RegistrySnapshot>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(RegistrySnapshot::default()),
        }
    }

    /// Read and parse the registry file
    pub async fn load(&self) -> Result<RegistrySnapshot> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read registry {}", self.path.display()))?;

        let snapshot: RegistrySnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse registry {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            users = snapshot.users.len(),
            clusters = snapshot.cluster_count(),
            "Loaded cluster registry"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl ClusterRegistry for FileRegistry {
    async fn list_users(&self) -> Result<Vec<User>> {
        let snapshot = self.load().await?;
        let users = snapshot.users();
        *self.snapshot.write().await = snapshot;
        Ok(users)
    }

    async fn list_clusters(&self, user_id: i64) -> Result<Vec<Cluster>> {
        Ok(self.snapshot.read().await.clusters_of(user_id))
    }
}
