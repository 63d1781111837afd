//! Webhook deduplication cache

use async_trait::async_trait;
use outpost_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Remembers recently seen webhook keys
#[async_trait]
pub trait DedupCache: Send + Sync {
    /// Record `key`; true if it was not already present and unexpired
    async fn check_and_set(&self, key: &str) -> Result<bool>;
    /// Drop `key` so a redelivery is processed again
    async fn forget(&self, key: &str) -> Result<()>;
    async fn purge_expired(&self) -> Result<usize>;
}

/// Dedup key for a signed webhook
pub fn dedup_key(timestamp: &str, token: &str) -> String {
    format!("{}:{}", timestamp.trim(), token.trim())
}

/// Process-local TTL cache
#[derive(Clone)]
pub struct InMemoryDedupCache {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryDedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl DedupCache for InMemoryDedupCache {
    async fn check_and_set(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + self.ttl);
                Ok(true)
            }
        }
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok(before - entries.len())
    }
}
