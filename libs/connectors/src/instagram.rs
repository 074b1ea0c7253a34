//! Instagram messaging connector.
//!
//! Instagram professional accounts are reached through the Facebook page
//! they are linked to: the asset is the Instagram account id, while the
//! send credential is the owning page's token.

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

pub struct InstagramConnector {
    ctx: ConnectorContext,
    flow: OAuthFlow,
    graph: Arc<dyn GraphClient>,
    refreshes: RefreshCoordinator,
}

impl InstagramConnector {
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

    /// Pages that actually carry a linked Instagram professional account.
    async fn list_instagram_assets(&self, user_token: &str) -> ConnectorResult<Vec<PageAsset>> {
        let url = format!("{}/me/accounts", self.api_base());
        let response = self.graph.get(&url, user_token).await?;
        Ok(parse_page_assets(&response)
            .into_iter()
            .filter(|asset| asset.instagram_account.is_some())
            .collect())
    }

    async fn bind_instagram(
        &self,
        connection: ChannelConnection,
        asset: &PageAsset,
        user_token: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> ConnectorResult<ChannelConnection> {
        let Some(ig) = asset.instagram_account.as_ref() else {
            return Err(ConnectorError::AssetNotFound(asset.page_id.clone()));
        };
        let token = ProviderToken {
            access_token: asset.page_token.clone(),
            refresh_token: Some(user_token.to_string()),
            expires_at,
        };
        self.ctx.tokens.put(&connection.id, &token).await?;
        let mut metadata = BTreeMap::new();
        metadata.insert("username".into(), Value::String(ig.username.clone()));
        metadata.insert("page_id".into(), Value::String(asset.page_id.clone()));
        self.ctx.bind_asset(connection, &ig.id, metadata).await
    }
}

#[async_trait]
impl ChannelConnector for InstagramConnector {
    fn channel(&self) -> ChannelType {
        ChannelType::Instagram
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

        let assets = self.list_instagram_assets(&user_token.access_token).await?;
        let mut connection = ChannelConnection::new(&claims.sub, ChannelType::Instagram);
        connection.token_expires_at = user_token.expires_at;
        if let Some(return_url) = &claims.return_url {
            connection
                .metadata
                .insert("return_url".into(), Value::String(return_url.clone()));
        }

        match assets.as_slice() {
            [] => {
                connection.mark_error("authorization grants access to no instagram accounts");
                self.ctx.connections.put(&connection).await?;
                Err(ConnectorError::ProviderAuth(
                    "no Instagram professional accounts available to this token".into(),
                ))
            }
            [asset] => {
                let expires_at = user_token.expires_at;
                let connection = self
                    .bind_instagram(connection, asset, &user_token.access_token, expires_at)
                    .await?;
                Ok(connection.id)
            }
            many => {
                connection.metadata.insert(
                    "available_assets".into(),
                    Value::Array(
                        many.iter()
                            .filter_map(|asset| asset.instagram_account.as_ref())
                            .map(|ig| json!({ "id": ig.id, "name": ig.username }))
                            .collect(),
                    ),
                );
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

        let assets = self.list_instagram_assets(&user_token).await?;
        let Some(asset) = assets.iter().find(|asset| {
            asset
                .instagram_account
                .as_ref()
                .is_some_and(|ig| ig.id == asset_id)
        }) else {
            return Err(ConnectorError::AssetNotFound(asset_id.to_string()));
        };
        connection.metadata.remove("available_assets");
        self.bind_instagram(connection, asset, &user_token, token.expires_at)
            .await?;
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus> {
        self.ctx.status(connection_id).await
    }

    fn ingest_webhook(&self, payload: &Value) -> Vec<UnifiedMessage> {
        normalize_messaging(payload, "instagram", ChannelType::Instagram)
    }

    async fn send_message(
        &self,
        connection_id: &str,
        message: &OutgoingMessage,
    ) -> ConnectorResult<String> {
        let (connection, token) = self.ctx.require_active(connection_id).await?;
        let payload = crate::facebook::FacebookConnector::build_send_payload(message)?;
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
        if !connection.asset_id.is_empty() {
            let assets = self.list_instagram_assets(&extended.access_token).await?;
            let Some(asset) = assets.iter().find(|asset| {
                asset
                    .instagram_account
                    .as_ref()
                    .is_some_and(|ig| ig.id == connection.asset_id)
            }) else {
                connection.mark_error("bound instagram account no longer accessible");
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
