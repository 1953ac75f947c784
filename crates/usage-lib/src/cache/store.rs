//! Key-value store with per-key expiry
//!
//! Entries are never deleted explicitly: they become unreadable once their
//! expiry passes and are dropped lazily on read or by [`CacheStore::purge_expired`].

use crate::clock::Clock;
use crate::error::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Storage backend for cached usage snapshots
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Write `value` under `key`, replacing any previous value, expiring after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Reset the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Read a live value
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Drop every expired entry, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Number of stored entries, live or not yet purged
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl StoredEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// In-process store backed by a concurrent map
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expiry(&self, ttl: Duration) -> Result<DateTime<Utc>, CacheError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| CacheError::Backend(format!("ttl out of range: {e}")))?;
        Ok(self.clock.now() + ttl)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = self.expiry(ttl)?;
        self.entries
            .insert(key.to_string(), StoredEntry { value, expires_at });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl)?;
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries go away on first read
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired cache entries");
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
