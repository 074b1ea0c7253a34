use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::ChannelType;

/// Lifecycle state of a channel connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Authorized and bound to a concrete provider asset.
    Active,
    /// Soft-disabled by disconnect; record kept while references exist.
    Inactive,
    /// Unrecoverable provider error (revoked permission, deleted asset).
    Error,
    /// Authorized but awaiting asset selection.
    Pending,
}

/// One authorized link between a tenant account and a provider asset.
///
/// Created by OAuth completion, mutated on refresh/error, soft-disabled on
/// disconnect. The access token itself lives in the token store, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConnection {
    pub id: String,
    pub tenant_id: String,
    pub channel: ChannelType,
    /// Provider asset id (phone-number id, page id, widget id). Empty until
    /// asset selection completes for multi-asset providers.
    #[serde(default)]
    pub asset_id: String,
    pub state: ConnectionState,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub token_expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ChannelConnection {
    pub fn new(tenant_id: impl Into<String>, channel: ChannelType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            channel,
            asset_id: String::new(),
            state: ConnectionState::Pending,
            token_expires_at: None,
            last_sync: None,
            last_error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Token validity as far as this record can tell: a known expiry in the
    /// past means invalid; no recorded expiry means valid until proven
    /// otherwise by a provider call.
    pub fn is_token_valid(&self, now: OffsetDateTime) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at > now,
            None => self.state == ConnectionState::Active,
        }
    }

    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.state = ConnectionState::Error;
        self.last_error = Some(error.into());
    }

    /// Derives the externally observable status snapshot.
    pub fn status(&self, now: OffsetDateTime) -> ConnectionStatus {
        ConnectionStatus {
            connection_id: self.id.clone(),
            channel: self.channel,
            asset_id: self.asset_id.clone(),
            state: self.state,
            is_token_valid: self.is_token_valid(now),
            last_sync: self.last_sync,
            last_error: self.last_error.clone(),
            token_expires_at: self.token_expires_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Derived, read-only view of connection health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connection_id: String,
    pub channel: ChannelType,
    #[serde(default)]
    pub asset_id: String,
    pub state: ConnectionState,
    pub is_token_valid: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub token_expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Token material persisted through the encrypted token store collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl ProviderToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn new_connection_starts_pending_without_asset() {
        let conn = ChannelConnection::new("acme", ChannelType::Facebook);
        assert_eq!(conn.state, ConnectionState::Pending);
        assert!(conn.asset_id.is_empty());
        assert!(!conn.is_active());
    }

    #[test]
    fn token_validity_uses_recorded_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut conn = ChannelConnection::new("acme", ChannelType::WhatsApp);
        conn.state = ConnectionState::Active;
        assert!(conn.is_token_valid(now));

        conn.token_expires_at = Some(now - Duration::minutes(1));
        assert!(!conn.is_token_valid(now));

        conn.token_expires_at = Some(now + Duration::hours(1));
        assert!(conn.is_token_valid(now));
    }

    #[test]
    fn status_snapshot_reflects_error_state() {
        let now = OffsetDateTime::now_utc();
        let mut conn = ChannelConnection::new("acme", ChannelType::Instagram);
        conn.mark_error("permission revoked");
        let status = conn.status(now);
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.last_error.as_deref(), Some("permission revoked"));
    }
}
