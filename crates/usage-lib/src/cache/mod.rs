//! Time-bucketed usage snapshots
//!
//! Snapshots are keyed by cluster, scope and minute-of-hour bucket:
//! `cluster-usage:{cluster_id}:{scope}:{bucket}`. Every write carries a fixed
//! TTL, so a dashboard sees roughly the last half hour of ticks.
//!
//! The bucket is the minute of the hour, not a full timestamp, so a tick at
//! 10:04 and a tick at 11:04 share a key. With the default 30 minute TTL the
//! older entry has always expired by then.

mod store;

pub use store::{CacheStore, MemoryStore};

use crate::error::CacheError;
use crate::models::UsageSample;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default lifetime of a cached snapshot
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Scope token used for the cluster-wide total
pub const CLUSTER_TOTAL_SCOPE: &str = "totalCpuUsage";

const KEY_PREFIX: &str = "cluster-usage";

/// What a snapshot describes within a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Pod(String),
    Namespace(String),
    ClusterTotal,
}

impl Scope {
    /// Interpret a scope segment as it appears in a key.
    ///
    /// Pod and namespace names share the key space, so any name other than
    /// the total token resolves to a pod scope with the same key.
    pub fn from_segment(segment: &str) -> Self {
        if segment == CLUSTER_TOTAL_SCOPE {
            Scope::ClusterTotal
        } else {
            Scope::Pod(segment.to_string())
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Pod(name) | Scope::Namespace(name) => f.write_str(name),
            Scope::ClusterTotal => f.write_str(CLUSTER_TOTAL_SCOPE),
        }
    }
}

/// Composite cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub cluster_id: i64,
    pub scope: Scope,
    /// Minute of the hour, 0-59
    pub bucket: u8,
}

impl CacheKey {
    pub fn new(cluster_id: i64, scope: Scope, bucket: u8) -> Self {
        Self {
            cluster_id,
            scope,
            bucket,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            KEY_PREFIX, self.cluster_id, self.scope, self.bucket
        )
    }
}

/// Typed access to usage snapshots on top of a [`CacheStore`]
#[derive(Clone)]
pub struct TimeBucketCache {
    store: Arc<dyn CacheStore>,
}

impl TimeBucketCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store_backend(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Write a snapshot, replacing whatever the key held
    pub async fn store(
        &self,
        key: &CacheKey,
        value: &UsageSample,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        self.store.set(&key.to_string(), payload, ttl).await
    }

    /// Reset a snapshot's TTL. Returns false if the key is not live.
    pub async fn touch_expiry(&self, key: &CacheKey, ttl: Duration) -> Result<bool, CacheError> {
        self.store.expire(&key.to_string(), ttl).await
    }

    /// Read one live snapshot
    pub async fn get(&self, key: &CacheKey) -> Result<Option<UsageSample>, CacheError> {
        let raw = self.store.get(&key.to_string()).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Every live bucket for a scope, oldest first
    pub async fn history(
        &self,
        cluster_id: i64,
        scope: &Scope,
    ) -> Result<Vec<(u8, UsageSample)>, CacheError> {
        let mut snapshots = Vec::new();
        for bucket in 0..60u8 {
            let key = CacheKey::new(cluster_id, scope.clone(), bucket);
            match self.get(&key).await {
                Ok(Some(sample)) => snapshots.push((bucket, sample)),
                Ok(None) => {}
                // One undecodable entry should not hide the rest
                Err(CacheError::Serialization(e)) => {
                    warn!(key = %key, error = %e, "Ignoring undecodable cache entry");
                }
                Err(e) => return Err(e),
            }
        }
        snapshots.sort_by_key(|(_, sample)| sample.collected_at);
        Ok(snapshots)
    }
}

/// Periodically purge expired entries until shutdown
pub async fn run_sweeper(
    store: Arc<dyn CacheStore>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = every.as_secs(), "Starting cache sweeper");
    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.purge_expired().await {
                    Ok(removed) => debug!(removed, remaining = store.len(), "Cache sweep complete"),
                    Err(e) => warn!(error = %e, "Cache sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down cache sweeper");
                break;
            }
        }
    }
}
