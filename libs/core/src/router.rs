use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ChannelType;

/// `(channel, provider channel identifier) -> (tenant, routing key)`.
///
/// The pair on the left is unique: a single external identifier must resolve
/// to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalAccountMapping {
    pub channel: ChannelType,
    pub channel_identifier: String,
    pub tenant_id: String,
    pub routing_key: String,
}

/// Resolution result handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub tenant_id: String,
    pub routing_key: String,
}

/// Lookup table from a provider's channel identifier to the owning tenant.
/// Read on every inbound webhook; written when a connection is established
/// or provisioned manually.
pub trait MappingStore: Send + Sync {
    fn resolve(&self, channel: ChannelType, channel_identifier: &str) -> Option<RouteTarget>;
    fn upsert(&self, mapping: ExternalAccountMapping);
    fn remove(&self, channel: ChannelType, channel_identifier: &str);
}

/// Concurrent in-memory mapping table.
#[derive(Default)]
pub struct InMemoryMappingStore {
    inner: DashMap<(ChannelType, String), RouteTarget>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for InMemoryMappingStore {
    fn resolve(&self, channel: ChannelType, channel_identifier: &str) -> Option<RouteTarget> {
        self.inner
            .get(&(channel, channel_identifier.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn upsert(&self, mapping: ExternalAccountMapping) {
        self.inner.insert(
            (mapping.channel, mapping.channel_identifier),
            RouteTarget {
                tenant_id: mapping.tenant_id,
                routing_key: mapping.routing_key,
            },
        );
    }

    fn remove(&self, channel: ChannelType, channel_identifier: &str) {
        self.inner
            .remove(&(channel, channel_identifier.to_string()));
    }
}

/// Maps a provider-supplied channel identifier to a tenant account.
///
/// Messages without a mapping are unrouted: the caller must drop them rather
/// than attribute them to a default tenant.
#[derive(Clone)]
pub struct AccountRouter {
    store: Arc<dyn MappingStore>,
}

impl AccountRouter {
    pub fn new(store: Arc<dyn MappingStore>) -> Self {
        Self { store }
    }

    pub fn resolve(&self, channel: ChannelType, channel_identifier: &str) -> Option<RouteTarget> {
        self.store.resolve(channel, channel_identifier)
    }

    pub fn register(&self, mapping: ExternalAccountMapping) {
        self.store.upsert(mapping);
    }

    pub fn unregister(&self, channel: ChannelType, channel_identifier: &str) {
        self.store.remove(channel, channel_identifier);
    }
}
