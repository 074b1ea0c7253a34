//! Web chat widget connector.
//!
//! There is no provider to authorize against: `start_auth` hands out a
//! setup link carrying the usual signed state, and completing it mints a
//! widget id plus a delivery secret. The connection is Active immediately,
//! no asset selection step.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, distr::Alphanumeric};
use serde_json::{Value, json};

use ucm_core::{
    ChannelConnection, ChannelType, ConnectionStatus, ConnectorError, ConnectorResult,
    OutgoingMessage, ProviderToken, UnifiedMessage,
};
use ucm_security::{STATE_TTL, SharedNonceStore, StateClaims, sign_state, verify_state};

use crate::connector::{AuthStart, CallbackParams, ChannelConnector, ConnectorContext};
use crate::graph::GraphClient;

pub struct WebChatConnector {
    ctx: ConnectorContext,
    state_secret: String,
    nonces: SharedNonceStore,
    /// Hosted widget setup page the tenant is sent to.
    setup_url: String,
    /// Base of the widget delivery API, `mock://` in tests.
    delivery_base: String,
    client: Arc<dyn GraphClient>,
}

impl WebChatConnector {
    pub fn new(
        ctx: ConnectorContext,
        state_secret: impl Into<String>,
        nonces: SharedNonceStore,
        setup_url: impl Into<String>,
        delivery_base: impl Into<String>,
        client: Arc<dyn GraphClient>,
    ) -> Self {
        Self {
            ctx,
            state_secret: state_secret.into(),
            nonces,
            setup_url: setup_url.into(),
            delivery_base: delivery_base.into(),
            client,
        }
    }

    fn widget_secret() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }
}

#[async_trait]
impl ChannelConnector for WebChatConnector {
    fn channel(&self) -> ChannelType {
        ChannelType::WebChat
    }

    async fn start_auth(
        &self,
        tenant_id: &str,
        return_url: Option<&str>,
    ) -> ConnectorResult<AuthStart> {
        let claims = StateClaims::new(tenant_id, return_url.map(str::to_string), STATE_TTL);
        let state =
            sign_state(&claims, &self.state_secret).map_err(ConnectorError::Internal)?;
        let auth_url = format!(
            "{}?state={}",
            self.setup_url.trim_end_matches('/'),
            state
        );
        Ok(AuthStart { auth_url, state })
    }

    async fn handle_callback(&self, params: CallbackParams) -> ConnectorResult<String> {
        if let Some(error) = &params.error {
            let detail = params
                .error_description
                .clone()
                .unwrap_or_else(|| error.clone());
            return Err(ConnectorError::ProviderAuth(detail));
        }
        let claims = verify_state(&params.state, &self.state_secret)
            .map_err(|err| ConnectorError::InvalidOAuthState(err.to_string()))?;
        let fresh = self
            .nonces
            .consume(&claims.jti, STATE_TTL.whole_seconds() as u64)
            .await?;
        if !fresh {
            return Err(ConnectorError::InvalidOAuthState(
                "state already consumed".into(),
            ));
        }

        let widget_id = format!("wgt-{}", uuid::Uuid::new_v4().simple());
        let mut connection = ChannelConnection::new(&claims.sub, ChannelType::WebChat);
        if let Some(return_url) = &claims.return_url {
            connection
                .metadata
                .insert("return_url".into(), Value::String(return_url.clone()));
        }
        // The widget delivery secret never expires; disconnecting revokes it.
        self.ctx
            .tokens
            .put(&connection.id, &ProviderToken::new(Self::widget_secret()))
            .await?;
        let connection = self
            .ctx
            .bind_asset(connection, &widget_id, BTreeMap::new())
            .await?;
        Ok(connection.id)
    }

    async fn get_status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus> {
        self.ctx.status(connection_id).await
    }

    /// Widget posts are already close to the unified shape; only inbound
    /// visitor messages arrive this way.
    fn ingest_webhook(&self, payload: &Value) -> Vec<UnifiedMessage> {
        let (Some(widget_id), Some(message_id), Some(session_id)) = (
            payload.get("widget_id").and_then(|v| v.as_str()),
            payload.get("message_id").and_then(|v| v.as_str()),
            payload.get("session_id").and_then(|v| v.as_str()),
        ) else {
            return Vec::new();
        };
        let sender = payload
            .pointer("/sender/id")
            .and_then(|v| v.as_str())
            .unwrap_or(session_id);

        let mut msg = UnifiedMessage::inbound(
            ChannelType::WebChat,
            widget_id,
            message_id,
            sender,
            widget_id,
        );
        msg.conversation_external_id = Some(session_id.to_string());
        msg.contact_name = payload
            .pointer("/sender/name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(text) = payload.get("text").and_then(|v| v.as_str()) {
            msg.text = Some(text.to_string());
        }
        if let Some(url) = payload.get("media_url").and_then(|v| v.as_str()) {
            msg.media_url = Some(url.to_string());
            msg.media_type = payload
                .get("media_type")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        if msg.text.is_none() && msg.media_url.is_none() {
            return Vec::new();
        }
        if let Some(ts) = payload.get("timestamp") {
            if let Some(secs) = ts.as_i64() {
                msg = msg.with_timestamp(ucm_core::unix_str_to_rfc3339(&secs.to_string()));
            } else if let Some(raw) = ts.as_str() {
                msg = msg.with_timestamp(raw.to_string());
            }
        }
        vec![msg]
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: &OutgoingMessage,
    ) -> ConnectorResult<String> {
        let (connection, token) = self.ctx.require_active(connection_id).await?;
        let mut body = json!({
            "session_id": message.to,
        });
        if let Some(text) = &message.text {
            body["text"] = json!(text);
        }
        if let Some(url) = &message.media_url {
            body["media_url"] = json!(url);
            if let Some(kind) = &message.media_type {
                body["media_type"] = json!(kind);
            }
        }
        if body.get("text").is_none() && body.get("media_url").is_none() {
            return Err(ConnectorError::ProviderRejected {
                status: 400,
                message: "message needs text or media".into(),
            });
        }
        let url = format!(
            "{}/widgets/{}/messages",
            self.delivery_base.trim_end_matches('/'),
            connection.asset_id
        );
        let response = self.client.post(&url, &token.access_token, &body).await?;
        response
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::unavailable("delivery response missing message id")
            })
    }

    async fn disconnect(&self, connection_id: &str) -> ConnectorResult<()> {
        self.ctx.disconnect(connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucm_core::{
        ConnectionState, Direction, InMemoryConnectionStore, InMemoryEventPublisher,
        InMemoryMappingStore, InMemoryTokenStore,
    };
    use ucm_security::InMemoryNonceStore;

    fn connector() -> WebChatConnector {
        let ctx = ConnectorContext {
            connections: Arc::new(InMemoryConnectionStore::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
            mappings: Arc::new(InMemoryMappingStore::new()),
            events: Arc::new(InMemoryEventPublisher::new()),
        };
        WebChatConnector::new(
            ctx,
            "state-secret",
            Arc::new(InMemoryNonceStore::new()),
            "https://chat.ucm.example/setup",
            "mock://chat-delivery",
            Arc::new(crate::graph::HttpGraphClient::new(reqwest::Client::new())),
        )
    }

    async fn installed(connector: &WebChatConnector) -> String {
        let started = connector.start_auth("acme", None).await.unwrap();
        connector
            .handle_callback(CallbackParams {
                state: started.state,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn setup_creates_an_active_widget_connection() {
        let connector = connector();
        let started = connector.start_auth("acme", None).await.unwrap();
        assert!(started.auth_url.starts_with("https://chat.ucm.example/setup?state="));

        let connection_id = connector
            .handle_callback(CallbackParams {
                state: started.state.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        let status = connector.get_status(&connection_id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Active);
        assert!(status.asset_id.starts_with("wgt-"));

        // The widget is routable straight away.
        let target = connector
            .ctx
            .mappings
            .resolve(ChannelType::WebChat, &status.asset_id)
            .expect("mapping registered");
        assert_eq!(target.tenant_id, "acme");

        // The setup link is single use.
        assert!(matches!(
            connector
                .handle_callback(CallbackParams {
                    state: started.state,
                    ..Default::default()
                })
                .await,
            Err(ConnectorError::InvalidOAuthState(_))
        ));
    }

    #[tokio::test]
    async fn visitor_message_is_normalized_with_session_threading() {
        let connector = connector();
        let connection_id = installed(&connector).await;
        let status = connector.get_status(&connection_id).await.unwrap();

        let payload = json!({
            "widget_id": status.asset_id,
            "message_id": "wc-msg-1",
            "session_id": "sess-42",
            "text": "hello?",
            "sender": { "id": "visitor-9", "name": "Ana" },
            "timestamp": 1700000000
        });
        let msgs = connector.ingest_webhook(&payload);
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.channel_identifier, status.asset_id);
        assert_eq!(msg.conversation_external_id.as_deref(), Some("sess-42"));
        assert_eq!(msg.contact_name.as_deref(), Some("Ana"));
        assert_eq!(msg.timestamp, "2023-11-14T22:13:20Z");

        // Payloads missing the identifying fields are skipped.
        assert!(connector.ingest_webhook(&json!({ "text": "hi" })).is_empty());
    }

    #[tokio::test]
    async fn send_targets_the_widget_delivery_endpoint() {
        let connector = connector();
        let connection_id = installed(&connector).await;
        let id = connector
            .send_message(&connection_id, &OutgoingMessage::text("sess-42", "hi"))
            .await
            .unwrap();
        assert!(id.starts_with("mock:mid."));

        // Empty messages are rejected before any delivery attempt.
        let mut empty = OutgoingMessage::text("sess-42", "");
        empty.text = None;
        assert!(matches!(
            connector.send_message(&connection_id, &empty).await,
            Err(ConnectorError::ProviderRejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_revokes_the_widget() {
        let connector = connector();
        let connection_id = installed(&connector).await;
        let status = connector.get_status(&connection_id).await.unwrap();
        connector.disconnect(&connection_id).await.unwrap();

        assert!(connector
            .ctx
            .mappings
            .resolve(ChannelType::WebChat, &status.asset_id)
            .is_none());
        assert!(matches!(
            connector
                .send_message(&connection_id, &OutgoingMessage::text("sess-42", "hi"))
                .await,
            Err(ConnectorError::ConnectionNotActive(_))
        ));
    }
}
