//! Short-TTL context cache
//!
//! Fronts the external data providers so repeated queries within a time
//! window do not refetch. Entries are evicted lazily on lookup once past
//! their `expires_at`; there is no background sweeper. An optional
//! `max_entries` bound evicts the least-recently-used key on overflow.

use crate::error::PipelineError;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Cache key derived deterministically from provider name + query
/// parameters. `serde_json` maps serialize with sorted keys, so identical
/// parameters always produce an identical key.
pub fn cache_key(provider_name: &str, params: &Value) -> String {
    format!("{}:{}", provider_name, params)
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    last_used: Instant,
}

/// Concurrent-safe TTL cache. The only long-lived shared mutable resource
/// in the pipeline; concurrent misses for the same key may both fetch and
/// both write (last write wins).
pub struct ContextCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl ContextCache {
    /// `max_entries == 0` leaves the cache unbounded.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Look up a key. Expired entries are removed and reported as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        validate_key(key)?;

        let now = Instant::now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_used = now;
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                debug!(key, "cache entry expired, evicted on lookup");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Insert a value with the given TTL. A zero TTL makes the entry
    /// immediately unservable.
    pub async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        validate_key(key)?;

        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if self.max_entries > 0
            && entries.len() >= self.max_entries
            && !entries.contains_key(key)
        {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(k, e)| (e.last_used, k.as_str().to_owned()))
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
                debug!(key = %victim, "cache full, evicted least-recently-used entry");
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_used: now,
            },
        );

        Ok(())
    }

    /// Number of entries currently held, including any not yet lazily
    /// evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn validate_key(key: &str) -> Result<()> {
    let mut parts = key.splitn(2, ':');
    let provider = parts.next().unwrap_or("");
    let params = parts.next().unwrap_or("");

    if provider.trim().is_empty() || params.trim().is_empty() {
        return Err(PipelineError::InvalidKey(key.to_string()));
    }

    Ok(())
}
