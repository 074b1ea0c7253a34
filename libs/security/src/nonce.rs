//! Single-use nonce consumption.
//!
//! Two concurrent callbacks presenting the same state must not both succeed,
//! so `consume` is an atomic check-and-invalidate: the first call for a
//! nonce returns `true`, every later call returns `false` until the TTL
//! evicts the record.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

#[async_trait]
pub trait NonceStore: Send + Sync {
    async fn consume(&self, nonce: &str, ttl_secs: u64) -> Result<bool>;
}

pub type SharedNonceStore = Arc<dyn NonceStore>;

/// In-memory store; the mutex makes consume atomic within the process.
#[derive(Clone, Default)]
pub struct InMemoryNonceStore {
    consumed: Arc<Mutex<HashMap<String, OffsetDateTime>>>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn consume(&self, nonce: &str, ttl_secs: u64) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let ttl = Duration::seconds(ttl_secs.max(1) as i64);
        let mut guard = self.consumed.lock().await;
        guard.retain(|_, expires| *expires > now);
        match guard.get(nonce) {
            Some(_) => Ok(false),
            None => {
                guard.insert(nonce.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_consume_wins_replay_loses() {
        let store = InMemoryNonceStore::new();
        assert!(store.consume("abc", 60).await.unwrap());
        assert!(!store.consume("abc", 60).await.unwrap());
        assert!(store.consume("def", 60).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_consumes_admit_exactly_one() {
        let store = InMemoryNonceStore::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.consume("race", 60).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
