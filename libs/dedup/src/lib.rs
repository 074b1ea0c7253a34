//! Deduplication layer for webhook ingestion.
//!
//! Providers redeliver webhooks at-least-once; this crate enforces the
//! uniqueness constraint on `(channel, external message id)` so redelivery
//! is an idempotent no-op. The store contract is a single atomic
//! put-if-absent: of two concurrent deliveries of the same key, exactly one
//! wins and the loser observes a duplicate outcome, not an error.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

/// Composite dedup key per channel/message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub channel: String,
    pub external_id: String,
}

impl DedupKey {
    pub fn new(channel: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            external_id: external_id.into(),
        }
    }
}

impl Display for DedupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.external_id)
    }
}

/// Contract implemented by dedup stores.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Attempts to register `key` with the provided TTL. Returns `Ok(true)`
    /// when the key did not previously exist (the caller should continue
    /// processing), `Ok(false)` for a duplicate, or an error when the store
    /// was unavailable.
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool>;
}

/// Shared trait object wrapper.
pub type SharedDedupStore = Arc<dyn DedupStore>;

/// In-memory store for tests and single-process deployments. The write lock
/// around the map makes insertion atomic with respect to concurrent
/// deliveries of the same key.
#[derive(Clone, Default)]
pub struct InMemoryDedupStore {
    inner: Arc<RwLock<HashMap<String, OffsetDateTime>>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self, now: OffsetDateTime) {
        let mut guard = self.inner.write().await;
        guard.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn put_if_absent(&self, key: &str, ttl_s: u64) -> Result<bool> {
        let ttl = Duration::seconds(ttl_s as i64);
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some(exp) if *exp > now => Ok(false),
            _ => {
                guard.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

/// Guard used by the gateway to deduplicate unified messages.
#[derive(Clone)]
pub struct DedupGuard {
    ttl_secs: u64,
    store: SharedDedupStore,
}

impl DedupGuard {
    pub fn new(store: SharedDedupStore, ttl_hours: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_hours.saturating_mul(3600).max(60),
        }
    }

    /// Returns `Ok(true)` when the caller should proceed (first sighting).
    pub async fn should_process(&self, key: &DedupKey) -> Result<bool> {
        let inserted = self
            .store
            .put_if_absent(&key.to_string(), self.ttl_secs)
            .await?;
        if !inserted {
            warn!(channel = %key.channel, external_id = %key.external_id, "duplicate message dropped");
            metrics::counter!("dedup_hit", "channel" => key.channel.clone()).increment(1);
        }
        Ok(inserted)
    }
}
