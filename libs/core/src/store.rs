//! Narrow interfaces to external collaborators: the encrypted token store,
//! the connection table, the conversation store, and the domain event bus.
//! In-memory implementations back tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{ChannelConnection, ProviderToken, UnifiedMessage};

/// Encrypted token store. The connector layer never handles raw secret
/// material beyond the single decrypt-at-use point behind this trait.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, connection_id: &str) -> Result<Option<ProviderToken>>;
    async fn put(&self, connection_id: &str, token: &ProviderToken) -> Result<()>;
    async fn delete(&self, connection_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    inner: RwLock<HashMap<String, ProviderToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, connection_id: &str) -> Result<Option<ProviderToken>> {
        Ok(self.inner.read().await.get(connection_id).cloned())
    }

    async fn put(&self, connection_id: &str, token: &ProviderToken) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(connection_id.to_string(), token.clone());
        Ok(())
    }

    async fn delete(&self, connection_id: &str) -> Result<()> {
        self.inner.write().await.remove(connection_id);
        Ok(())
    }
}

/// Connection records, always looked up by connection id so no stale
/// per-process cache can leak state across tenants.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, connection_id: &str) -> Result<Option<ChannelConnection>>;
    async fn put(&self, connection: &ChannelConnection) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConnectionStore {
    inner: RwLock<HashMap<String, ChannelConnection>>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn get(&self, connection_id: &str) -> Result<Option<ChannelConnection>> {
        Ok(self.inner.read().await.get(connection_id).cloned())
    }

    async fn put(&self, connection: &ChannelConnection) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }
}

/// Message routed to a tenant, ready for the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedMessage {
    pub tenant_id: String,
    pub routing_key: String,
    pub message: UnifiedMessage,
}

/// External conversation store. The connector layer only appends.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, routed: &RoutedMessage) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    inner: RwLock<Vec<RoutedMessage>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<RoutedMessage> {
        self.inner.read().await.clone()
    }

    pub async fn count_by_external_id(&self, external_id: &str) -> usize {
        self.inner
            .read()
            .await
            .iter()
            .filter(|routed| routed.message.external_id == external_id)
            .count()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, routed: &RoutedMessage) -> Result<()> {
        self.inner.write().await.push(routed.clone());
        Ok(())
    }
}

/// Domain events emitted after successful ingestion or dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    MessageReceived {
        tenant_id: String,
        channel: String,
        external_id: String,
    },
    MessageSent {
        tenant_id: String,
        channel: String,
        external_id: String,
    },
    ConnectionEstablished {
        tenant_id: String,
        channel: String,
        connection_id: String,
    },
    ConnectionDisconnected {
        tenant_id: String,
        channel: String,
        connection_id: String,
    },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}

/// Default publisher for single-process deployments: structured log lines
/// that downstream shippers pick up.
#[derive(Default, Clone)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        tracing::info!(event = ?event, "domain event");
        Ok(())
    }
}

/// Capturing publisher for tests.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    inner: RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DomainEvent> {
        self.inner.read().await.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.inner.write().await.push(event);
        Ok(())
    }
}

pub type SharedTokenStore = Arc<dyn TokenStore>;
pub type SharedConnectionStore = Arc<dyn ConnectionStore>;
pub type SharedConversationStore = Arc<dyn ConversationStore>;
pub type SharedEventPublisher = Arc<dyn EventPublisher>;
