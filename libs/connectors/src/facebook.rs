//! Facebook Messenger connector (page-backed).
//!
//! The stored token holds the bound page's token as `access_token` and the
//! long-lived user token as `refresh_token`; the user token is what lists
//! pages and re-derives page tokens on refresh.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;

use ucm_core::{
    ChannelConnection, ChannelType, ConnectionState, ConnectionStatus, ConnectorError,
    ConnectorResult, OutgoingMessage, ProviderToken, UnifiedMessage,
};

use crate::connector::{AuthStart, CallbackParams, ChannelConnector, ConnectorContext};
use crate::graph::GraphClient;
use crate::meta::{PageAsset, normalize_messaging, parse_page_assets};
use crate::oauth::{OAuthFlow, RefreshCoordinator};

pub struct FacebookConnector {
    ctx: ConnectorContext,
    flow: OAuthFlow,
    graph: Arc<dyn GraphClient>,
    refreshes: RefreshCoordinator,
}

impl FacebookConnector {
    pub fn new(ctx: ConnectorContext, flow: OAuthFlow, graph: Arc<dyn GraphClient>) -> Self {
        Self {
            ctx,
            flow,
            graph,
            refreshes: RefreshCoordinator::new(),
        }
    }

    fn api_base(&self) -> &str {
        self.flow.app().api_base.trim_end_matches('/')
    }

    async fn list_pages(&self, user_token: &str) -> ConnectorResult<Vec<PageAsset>> {
        let url = format!("{}/me/accounts", self.api_base());
        let response = self.graph.get(&url, user_token).await?;
        Ok(parse_page_assets(&response))
    }

    pub(crate) fn build_send_payload(message: &OutgoingMessage) -> ConnectorResult<Value> {
        let mut body = json!({});
        if let Some(text) = &message.text {
            body["text"] = json!(text);
        }
        if let Some(url) = &message.media_url {
            let kind = match message.media_type.as_deref() {
                Some(t) if t.starts_with("image") => "image",
                Some(t) if t.starts_with("video") => "video",
                Some(t) if t.starts_with("audio") => "audio",
                _ => "file",
            };
            body["attachment"] = json!({
                "type": kind,
                "payload": { "url": url, "is_reusable": false }
            });
        }
        if body.as_object().is_some_and(|o| o.is_empty()) {
            return Err(ConnectorError::rejected(400, "message has neither text nor media"));
        }
        let mut payload = json!({
            "recipient": { "id": message.to },
            "messaging_type": "RESPONSE",
            "message": body,
        });
        if let Some(reply_to) = &message.reply_to_message_id {
            payload["message"]["reply_to"] = json!({ "mid": reply_to });
        }
        for (key, value) in &message.options {
            payload[key.as_str()] = value.clone();
        }
        Ok(payload)
    }

    async fn bind_page(
        &self,
        connection: ChannelConnection,
        asset: &PageAsset,
        user_token: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> ConnectorResult<ChannelConnection> {
        let token = ProviderToken {
            access_token: asset.page_token.clone(),
            refresh_token: Some(user_token.to_string()),
            expires_at,
        };
        self.ctx.tokens.put(&connection.id, &token).await?;
        let mut metadata = BTreeMap::new();
        metadata.insert("page_name".into(), Value::String(asset.name.clone()));
        self.ctx.bind_asset(connection, &asset.page_id, metadata).await
    }
}

#[async_trait]
impl ChannelConnector for FacebookConnector {
    fn channel(&self) -> ChannelType {
        ChannelType::Facebook
    }

    async fn start_auth(
        &self,
        tenant_id: &str,
        return_url: Option<&str>,
    ) -> ConnectorResult<AuthStart> {
        self.flow.start(tenant_id, return_url)
    }

    async fn handle_callback(&self, params: CallbackParams) -> ConnectorResult<String> {
        let claims = self.flow.consume_callback_state(&params).await?;
        let code = params.code.as_deref().ok_or_else(|| {
            ConnectorError::ProviderAuth("authorization code missing from callback".into())
        })?;

        let short = self.flow.exchange_code(code).await?;
        let long = self.flow.extend_token(&short.access_token).await?;
        let user_token = long.into_provider_token();

        let pages = self.list_pages(&user_token.access_token).await?;
        let mut connection = ChannelConnection::new(&claims.sub, ChannelType::Facebook);
        connection.token_expires_at = user_token.expires_at;
        if let Some(return_url) = &claims.return_url {
            connection
                .metadata
                .insert("return_url".into(), Value::String(return_url.clone()));
        }

        match pages.as_slice() {
            [] => {
                connection.mark_error("authorization grants access to no pages");
                self.ctx.connections.put(&connection).await?;
                Err(ConnectorError::ProviderAuth(
                    "no Facebook pages available to this token".into(),
                ))
            }
            [asset] => {
                let expires_at = user_token.expires_at;
                let connection = self
                    .bind_page(connection, asset, &user_token.access_token, expires_at)
                    .await?;
                Ok(connection.id)
            }
            many => {
                connection.metadata.insert(
                    "available_assets".into(),
                    Value::Array(
                        many.iter()
                            .map(|asset| json!({ "id": asset.page_id, "name": asset.name }))
                            .collect(),
                    ),
                );
                // Until a page is chosen only the user token exists.
                self.ctx.tokens.put(&connection.id, &user_token).await?;
                self.ctx.connections.put(&connection).await?;
                Ok(connection.id)
            }
        }
    }

    async fn select_asset(&self, connection_id: &str, asset_id: &str) -> ConnectorResult<()> {
        let mut connection = self.ctx.load_connection(connection_id).await?;
        if connection.state == ConnectionState::Active && connection.asset_id == asset_id {
            return Ok(());
        }
        // Asset selection only completes a pending authorization. A
        // disconnected or errored connection stays that way; reconnecting
        // takes a fresh start_auth.
        if connection.state != ConnectionState::Pending {
            return Err(ConnectorError::ConnectionNotActive(format!(
                "{connection_id} is {:?}; asset selection requires a pending connection",
                connection.state
            )));
        }
        let token = self
            .ctx
            .tokens
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotActive(format!("{connection_id}: no stored token")))?;
        let user_token = token
            .refresh_token
            .clone()
            .unwrap_or(token.access_token.clone());

        // Re-list pages under the user token; the asset must be among them.
        let pages = self.list_pages(&user_token).await?;
        let Some(asset) = pages.iter().find(|asset| asset.page_id == asset_id) else {
            return Err(ConnectorError::AssetNotFound(asset_id.to_string()));
        };
        connection.metadata.remove("available_assets");
        self.bind_page(connection, asset, &user_token, token.expires_at)
            .await?;
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus> {
        self.ctx.status(connection_id).await
    }

    fn ingest_webhook(&self, payload: &Value) -> Vec<UnifiedMessage> {
        normalize_messaging(payload, "page", ChannelType::Facebook)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: &OutgoingMessage,
    ) -> ConnectorResult<String> {
        let (connection, token) = self.ctx.require_active(connection_id).await?;
        let payload = Self::build_send_payload(message)?;
        let url = format!("{}/{}/messages", self.api_base(), connection.asset_id);
        let response = match self.graph.post(&url, &token.access_token, &payload).await {
            Ok(response) => response,
            Err(ConnectorError::ProviderRejected { status, message })
                if status == 401 || status == 403 =>
            {
                self.ctx.mark_token_invalid(connection_id, &message).await?;
                return Err(ConnectorError::ConnectionNotActive(format!(
                    "{connection_id}: provider rejected token ({message})"
                )));
            }
            Err(err) => return Err(err),
        };
        response
            .get("message_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::unavailable("send response missing provider message id")
            })
    }

    async fn refresh_token(&self, connection_id: &str) -> ConnectorResult<()> {
        let lock = self.refreshes.lock_for(connection_id);
        let _guard = lock.lock().await;

        let token = self
            .ctx
            .tokens
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotActive(format!("{connection_id}: no stored token")))?;
        if RefreshCoordinator::is_fresh(token.expires_at) {
            return Ok(());
        }
        let user_token = token
            .refresh_token
            .clone()
            .unwrap_or(token.access_token.clone());

        let extended = self.flow.extend_token(&user_token).await?;
        let extended = extended.into_provider_token();

        let mut connection = self.ctx.load_connection(connection_id).await?;
        // Re-derive the page token under the fresh user token.
        if !connection.asset_id.is_empty() {
            let pages = self.list_pages(&extended.access_token).await?;
            let Some(asset) = pages.iter().find(|asset| asset.page_id == connection.asset_id)
            else {
                connection.mark_error("bound page no longer accessible");
                self.ctx.connections.put(&connection).await?;
                return Err(ConnectorError::AssetNotFound(connection.asset_id.clone()));
            };
            let token = ProviderToken {
                access_token: asset.page_token.clone(),
                refresh_token: Some(extended.access_token.clone()),
                expires_at: extended.expires_at,
            };
            self.ctx.tokens.put(connection_id, &token).await?;
        } else {
            self.ctx.tokens.put(connection_id, &extended).await?;
        }
        connection.token_expires_at = extended.expires_at;
        connection.last_sync = Some(OffsetDateTime::now_utc());
        connection.last_error = None;
        self.ctx.connections.put(&connection).await?;
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> ConnectorResult<()> {
        self.ctx.disconnect(connection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::OAuthApp;
    use std::sync::Arc;
    use ucm_core::{
        InMemoryConnectionStore, InMemoryEventPublisher, InMemoryMappingStore, InMemoryTokenStore,
    };
    use ucm_security::InMemoryNonceStore;

    struct TwoPageGraph;

    #[async_trait::async_trait]
    impl GraphClient for TwoPageGraph {
        async fn get(&self, url: &str, _access_token: &str) -> ConnectorResult<Value> {
            assert!(url.contains("/me/accounts"));
            Ok(json!({
                "data": [
                    { "id": "page-1", "name": "Acme Page", "access_token": "page-token-1" },
                    { "id": "page-2", "name": "Globex Page", "access_token": "page-token-2" }
                ]
            }))
        }

        async fn post(&self, _url: &str, _access_token: &str, _body: &Value) -> ConnectorResult<Value> {
            Ok(json!({ "message_id": "mid.sent" }))
        }
    }

    fn ctx() -> ConnectorContext {
        ConnectorContext {
            connections: Arc::new(InMemoryConnectionStore::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
            mappings: Arc::new(InMemoryMappingStore::new()),
            events: Arc::new(InMemoryEventPublisher::new()),
        }
    }

    fn app() -> OAuthApp {
        OAuthApp {
            client_id: "app-id".into(),
            client_secret: "app-secret".into(),
            redirect_url: "https://ucm.example/oauth/facebook/callback".into(),
            auth_base: "https://www.facebook.com/v19.0/dialog/oauth".into(),
            api_base: "mock://graph/v19.0".into(),
            scopes: vec!["pages_messaging".into()],
        }
    }

    fn connector_with(graph: Arc<dyn GraphClient>) -> FacebookConnector {
        let flow = OAuthFlow::new(app(), "state-secret", Arc::new(InMemoryNonceStore::new()));
        FacebookConnector::new(ctx(), flow, graph)
    }

    #[tokio::test]
    async fn multi_page_callback_stops_at_asset_selection() {
        let connector = connector_with(Arc::new(TwoPageGraph));
        let started = connector.start_auth("acme", None).await.unwrap();
        let connection_id = connector
            .handle_callback(CallbackParams {
                code: Some("abc".into()),
                state: started.state,
                ..Default::default()
            })
            .await
            .unwrap();

        let status = connector.get_status(&connection_id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Pending);
        let assets = status.metadata.get("available_assets").unwrap();
        assert_eq!(assets.as_array().unwrap().len(), 2);

        // No routing mapping exists until an asset is bound.
        assert!(connector.ctx.mappings.resolve(ChannelType::Facebook, "page-1").is_none());

        connector.select_asset(&connection_id, "page-2").await.unwrap();
        let status = connector.get_status(&connection_id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Active);
        assert!(status.metadata.get("available_assets").is_none());
        assert_eq!(
            connector
                .ctx
                .mappings
                .resolve(ChannelType::Facebook, "page-2")
                .unwrap()
                .tenant_id,
            "acme"
        );

        // The bound token is the page token, the user token kept for refresh.
        let token = connector
            .ctx
            .tokens
            .get(&connection_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.access_token, "page-token-2");
        assert!(token.refresh_token.is_some());
    }

    #[tokio::test]
    async fn selecting_an_inaccessible_asset_fails() {
        let connector = connector_with(Arc::new(TwoPageGraph));
        let started = connector.start_auth("acme", None).await.unwrap();
        let connection_id = connector
            .handle_callback(CallbackParams {
                code: Some("abc".into()),
                state: started.state,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(matches!(
            connector.select_asset(&connection_id, "page-999").await,
            Err(ConnectorError::AssetNotFound(_))
        ));
    }

    #[tokio::test]
    async fn select_asset_cannot_revive_a_disconnected_connection() {
        let connector = connector_with(Arc::new(TwoPageGraph));
        let started = connector.start_auth("acme", None).await.unwrap();
        let connection_id = connector
            .handle_callback(CallbackParams {
                code: Some("abc".into()),
                state: started.state,
                ..Default::default()
            })
            .await
            .unwrap();
        connector.disconnect(&connection_id).await.unwrap();

        assert!(matches!(
            connector.select_asset(&connection_id, "page-1").await,
            Err(ConnectorError::ConnectionNotActive(_))
        ));
        let status = connector.get_status(&connection_id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Inactive);
        assert!(connector
            .ctx
            .mappings
            .resolve(ChannelType::Facebook, "page-1")
            .is_none());
    }

    #[tokio::test]
    async fn single_page_callback_binds_immediately() {
        // The mock:// graph client serves exactly one page.
        let connector = connector_with(Arc::new(crate::graph::HttpGraphClient::new(
            reqwest::Client::new(),
        )));
        let started = connector.start_auth("acme", None).await.unwrap();
        let connection_id = connector
            .handle_callback(CallbackParams {
                code: Some("abc".into()),
                state: started.state,
                ..Default::default()
            })
            .await
            .unwrap();

        let status = connector.get_status(&connection_id).await.unwrap();
        assert_eq!(status.state, ConnectionState::Active);
        assert_eq!(
            status.metadata.get("page_name").and_then(|v| v.as_str()),
            Some("Acme Page")
        );

        let sent = connector
            .send_message(&connection_id, &OutgoingMessage::text("user-77", "hello"))
            .await
            .unwrap();
        assert!(sent.starts_with("mock:mid."));
    }

    #[test]
    fn send_payload_includes_recipient_and_attachment() {
        let mut message = OutgoingMessage::text("user-77", "hi");
        message.media_url = Some("https://cdn.example/v.mp4".into());
        message.media_type = Some("video/mp4".into());
        let payload = FacebookConnector::build_send_payload(&message).unwrap();
        assert_eq!(payload["recipient"]["id"], "user-77");
        assert_eq!(payload["message"]["attachment"]["type"], "video");
    }
}
