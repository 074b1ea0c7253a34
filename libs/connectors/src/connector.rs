use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use ucm_core::{
    ChannelConnection, ChannelType, ConnectionState, ConnectionStatus, ConnectorError,
    ConnectorResult, DomainEvent, ExternalAccountMapping, MappingStore, OutgoingMessage,
    ProviderToken, SharedConnectionStore, SharedEventPublisher, SharedTokenStore, UnifiedMessage,
};

/// Result of `start_auth`: the URL to redirect the end user to, plus the
/// signed state embedded in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStart {
    pub auth_url: String,
    pub state: String,
}

/// Query parameters the provider redirects back with.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// The per-provider capability set. One implementation per channel, selected
/// by `ChannelType` tag at the gateway.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    fn channel(&self) -> ChannelType;

    /// Issues a state token and builds the provider's authorization URL.
    async fn start_auth(&self, tenant_id: &str, return_url: Option<&str>)
    -> ConnectorResult<AuthStart>;

    /// Consumes the state token (single use), exchanges the code, and
    /// persists the connection. Returns the new connection id.
    async fn handle_callback(&self, params: CallbackParams) -> ConnectorResult<String>;

    /// Binds a pending connection to one concrete provider asset. Only
    /// multi-asset providers override this.
    async fn select_asset(&self, connection_id: &str, asset_id: &str) -> ConnectorResult<()> {
        let _ = (connection_id, asset_id);
        Err(ConnectorError::Unsupported {
            channel: self.channel().as_str(),
            operation: "select_asset",
        })
    }

    /// Read-only status snapshot; never mutates.
    async fn get_status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus>;

    /// Provider-specific half of normalization. The caller has already
    /// verified the signature. Unrecognized fragments are skipped, never an
    /// error; recognized-but-irrelevant events yield an empty list.
    fn ingest_webhook(&self, payload: &Value) -> Vec<UnifiedMessage>;

    /// Performs the provider API call and returns the provider-assigned
    /// message id.
    async fn send_message(
        &self,
        connection_id: &str,
        message: &OutgoingMessage,
    ) -> ConnectorResult<String>;

    /// Re-derives a fresh token. Safe to call concurrently for the same
    /// connection; only one refresh hits the provider at a time.
    async fn refresh_token(&self, connection_id: &str) -> ConnectorResult<()> {
        let _ = connection_id;
        Err(ConnectorError::Unsupported {
            channel: self.channel().as_str(),
            operation: "refresh_token",
        })
    }

    /// Clears the stored token and marks the connection inactive.
    /// Idempotent: disconnecting an inactive connection is a no-op.
    async fn disconnect(&self, connection_id: &str) -> ConnectorResult<()>;
}

/// Shared collaborators every connector composes: connection records, the
/// encrypted token store, the mapping table, and the event bus. Held by
/// reference so tests swap in fakes.
#[derive(Clone)]
pub struct ConnectorContext {
    pub connections: SharedConnectionStore,
    pub tokens: SharedTokenStore,
    pub mappings: Arc<dyn MappingStore>,
    pub events: SharedEventPublisher,
}

impl ConnectorContext {
    pub async fn load_connection(&self, connection_id: &str) -> ConnectorResult<ChannelConnection> {
        self.connections
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotFound(connection_id.to_string()))
    }

    /// Loads the connection and its token, rejecting anything not usable for
    /// a send: wrong state, missing token, or expired token.
    pub async fn require_active(
        &self,
        connection_id: &str,
    ) -> ConnectorResult<(ChannelConnection, ProviderToken)> {
        let connection = self.load_connection(connection_id).await?;
        if connection.state != ConnectionState::Active {
            return Err(ConnectorError::ConnectionNotActive(format!(
                "{connection_id} is {:?}",
                connection.state
            )));
        }
        let token = self
            .tokens
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotActive(format!("{connection_id}: no stored token")))?;
        if let Some(expires_at) = token.expires_at {
            if expires_at <= OffsetDateTime::now_utc() {
                return Err(ConnectorError::ConnectionNotActive(format!(
                    "{connection_id}: token expired"
                )));
            }
        }
        Ok((connection, token))
    }

    pub async fn status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus> {
        let connection = self.load_connection(connection_id).await?;
        Ok(connection.status(OffsetDateTime::now_utc()))
    }

    /// Binds a connection to a concrete asset: registers the routing
    /// mapping, activates the connection, and announces it.
    pub async fn bind_asset(
        &self,
        mut connection: ChannelConnection,
        asset_id: &str,
        metadata: BTreeMap<String, Value>,
    ) -> ConnectorResult<ChannelConnection> {
        connection.asset_id = asset_id.to_string();
        connection.state = ConnectionState::Active;
        connection.last_sync = Some(OffsetDateTime::now_utc());
        connection.metadata.extend(metadata);
        self.mappings.upsert(ExternalAccountMapping {
            channel: connection.channel,
            channel_identifier: asset_id.to_string(),
            tenant_id: connection.tenant_id.clone(),
            routing_key: format!(
                "{}:{}:{}",
                connection.tenant_id,
                connection.channel.as_str(),
                asset_id
            ),
        });
        self.connections.put(&connection).await?;
        self.events
            .publish(DomainEvent::ConnectionEstablished {
                tenant_id: connection.tenant_id.clone(),
                channel: connection.channel.as_str().to_string(),
                connection_id: connection.id.clone(),
            })
            .await?;
        Ok(connection)
    }

    /// Shared disconnect path: revoke the token, drop the mapping, soft-
    /// disable the record. Safe to repeat.
    pub async fn disconnect(&self, connection_id: &str) -> ConnectorResult<()> {
        let mut connection = self.load_connection(connection_id).await?;
        if connection.state == ConnectionState::Inactive {
            return Ok(());
        }
        self.tokens.delete(connection_id).await?;
        if !connection.asset_id.is_empty() {
            self.mappings
                .remove(connection.channel, &connection.asset_id);
        }
        connection.state = ConnectionState::Inactive;
        self.connections.put(&connection).await?;
        self.events
            .publish(DomainEvent::ConnectionDisconnected {
                tenant_id: connection.tenant_id.clone(),
                channel: connection.channel.as_str().to_string(),
                connection_id: connection.id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Records a provider-signalled auth failure on the connection so status
    /// reads surface it. Token expiry is detected lazily on send/refresh.
    pub async fn mark_token_invalid(
        &self,
        connection_id: &str,
        reason: &str,
    ) -> ConnectorResult<()> {
        let mut connection = self.load_connection(connection_id).await?;
        connection.token_expires_at = Some(OffsetDateTime::now_utc());
        connection.last_error = Some(reason.to_string());
        self.connections.put(&connection).await?;
        Ok(())
    }
}
