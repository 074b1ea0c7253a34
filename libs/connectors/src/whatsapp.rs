//! WhatsApp Business Cloud API connector.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;

use ucm_core::{
    ChannelConnection, ChannelType, ConnectionState, ConnectionStatus, ConnectorError,
    ConnectorResult, DeliveryStatus, OutgoingMessage, UnifiedMessage,
};

use crate::connector::{AuthStart, CallbackParams, ChannelConnector, ConnectorContext};
use crate::graph::GraphClient;
use crate::oauth::{OAuthFlow, RefreshCoordinator};

pub struct WhatsAppConnector {
    ctx: ConnectorContext,
    flow: OAuthFlow,
    graph: Arc<dyn GraphClient>,
    refreshes: RefreshCoordinator,
}

impl WhatsAppConnector {
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

    async fn list_phone_numbers(&self, access_token: &str) -> ConnectorResult<Vec<(String, String)>> {
        let url = format!("{}/me/phone_numbers", self.api_base());
        let response = self.graph.get(&url, access_token).await?;
        let Some(data) = response.get("data").and_then(|v| v.as_array()) else {
            return Ok(Vec::new());
        };
        Ok(data
            .iter()
            .filter_map(|entry| {
                let id = entry.get("id")?.as_str()?.to_string();
                let name = entry
                    .get("verified_name")
                    .and_then(|v| v.as_str())
                    .or_else(|| entry.get("display_phone_number").and_then(|v| v.as_str()))
                    .unwrap_or_default()
                    .to_string();
                Some((id, name))
            })
            .collect())
    }

    fn build_send_payload(message: &OutgoingMessage) -> ConnectorResult<Value> {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "to": message.to,
        });
        if let Some(url) = &message.media_url {
            let kind = match message.media_type.as_deref() {
                Some(t) if t.starts_with("image") => "image",
                Some(t) if t.starts_with("video") => "video",
                Some(t) if t.starts_with("audio") => "audio",
                _ => "document",
            };
            payload["type"] = json!(kind);
            let mut media = json!({ "link": url });
            if let Some(text) = &message.text {
                media["caption"] = json!(text);
            }
            payload[kind] = media;
        } else if let Some(text) = &message.text {
            payload["type"] = json!("text");
            payload["text"] = json!({ "body": text });
        } else {
            return Err(ConnectorError::rejected(400, "message has neither text nor media"));
        }
        if let Some(reply_to) = &message.reply_to_message_id {
            payload["context"] = json!({ "message_id": reply_to });
        }
        for (key, value) in &message.options {
            payload[key.as_str()] = value.clone();
        }
        Ok(payload)
    }
}

#[async_trait]
impl ChannelConnector for WhatsAppConnector {
    fn channel(&self) -> ChannelType {
        ChannelType::WhatsApp
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
        let token = long.into_provider_token();

        let assets = self.list_phone_numbers(&token.access_token).await?;
        let mut connection = ChannelConnection::new(&claims.sub, ChannelType::WhatsApp);
        connection.token_expires_at = token.expires_at;
        if let Some(return_url) = &claims.return_url {
            connection
                .metadata
                .insert("return_url".into(), Value::String(return_url.clone()));
        }
        self.ctx.tokens.put(&connection.id, &token).await?;

        match assets.as_slice() {
            [] => {
                connection.mark_error("authorization grants access to no phone numbers");
                self.ctx.connections.put(&connection).await?;
                Err(ConnectorError::ProviderAuth(
                    "no WhatsApp phone numbers available to this token".into(),
                ))
            }
            [(id, name)] => {
                let mut metadata = BTreeMap::new();
                metadata.insert("verified_name".into(), Value::String(name.clone()));
                let connection = self.ctx.bind_asset(connection, id, metadata).await?;
                Ok(connection.id)
            }
            many => {
                connection.metadata.insert(
                    "available_assets".into(),
                    Value::Array(
                        many.iter()
                            .map(|(id, name)| json!({ "id": id, "name": name }))
                            .collect(),
                    ),
                );
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
        let available = connection
            .metadata
            .get("available_assets")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let Some(chosen) = available
            .iter()
            .find(|asset| asset.get("id").and_then(|v| v.as_str()) == Some(asset_id))
        else {
            return Err(ConnectorError::AssetNotFound(asset_id.to_string()));
        };
        let mut metadata = BTreeMap::new();
        if let Some(name) = chosen.get("name").and_then(|v| v.as_str()) {
            metadata.insert("verified_name".into(), Value::String(name.to_string()));
        }
        connection.metadata.remove("available_assets");
        self.ctx.bind_asset(connection, asset_id, metadata).await?;
        Ok(())
    }

    async fn get_status(&self, connection_id: &str) -> ConnectorResult<ConnectionStatus> {
        self.ctx.status(connection_id).await
    }

    fn ingest_webhook(&self, payload: &Value) -> Vec<UnifiedMessage> {
        normalize(payload)
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
            .pointer("/messages/0/id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ConnectorError::unavailable("send response missing provider message id")
            })
    }

    async fn refresh_token(&self, connection_id: &str) -> ConnectorResult<()> {
        let lock = self.refreshes.lock_for(connection_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent refresher may have finished
        // while we waited, in which case its result is reused.
        let token = self
            .ctx
            .tokens
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotActive(format!("{connection_id}: no stored token")))?;
        if RefreshCoordinator::is_fresh(token.expires_at) {
            return Ok(());
        }

        let refreshed = self.flow.extend_token(&token.access_token).await?;
        let new_token = refreshed.into_provider_token();
        self.ctx.tokens.put(connection_id, &new_token).await?;

        let mut connection = self.ctx.load_connection(connection_id).await?;
        connection.token_expires_at = new_token.expires_at;
        connection.last_sync = Some(OffsetDateTime::now_utc());
        connection.last_error = None;
        self.ctx.connections.put(&connection).await?;
        Ok(())
    }

    async fn disconnect(&self, connection_id: &str) -> ConnectorResult<()> {
        self.ctx.disconnect(connection_id).await
    }
}

/// Maps a Cloud API webhook payload into unified messages. The dedup key is
/// the `wamid`; status notifications get `{wamid}#{status}` so each status
/// change dedups independently of the message itself.
pub fn normalize(payload: &Value) -> Vec<UnifiedMessage> {
    let mut out = Vec::new();
    let Some(entries) = payload.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) else {
            continue;
        };
        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let Some(phone_number_id) = value
                .pointer("/metadata/phone_number_id")
                .and_then(|v| v.as_str())
            else {
                continue;
            };

            let contact_names: BTreeMap<&str, &str> = value
                .get("contacts")
                .and_then(|v| v.as_array())
                .map(|contacts| {
                    contacts
                        .iter()
                        .filter_map(|c| {
                            Some((
                                c.get("wa_id")?.as_str()?,
                                c.pointer("/profile/name")?.as_str()?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();

            if let Some(messages) = value.get("messages").and_then(|v| v.as_array()) {
                for message in messages {
                    if let Some(msg) =
                        inbound_from_message(phone_number_id, message, &contact_names)
                    {
                        out.push(msg);
                    }
                }
            }

            if let Some(statuses) = value.get("statuses").and_then(|v| v.as_array()) {
                for status in statuses {
                    if let Some(update) = status_update(phone_number_id, status) {
                        out.push(update);
                    }
                }
            }
        }
    }
    out
}

fn inbound_from_message(
    phone_number_id: &str,
    message: &Value,
    contact_names: &BTreeMap<&str, &str>,
) -> Option<UnifiedMessage> {
    let id = message.get("id")?.as_str()?;
    let from = message.get("from")?.as_str()?;
    let kind = message.get("type").and_then(|v| v.as_str()).unwrap_or("");

    let mut msg = UnifiedMessage::inbound(
        ChannelType::WhatsApp,
        phone_number_id,
        id,
        from,
        phone_number_id,
    );
    if let Some(ts) = message.get("timestamp").and_then(|v| v.as_str()) {
        msg.timestamp = ucm_core::unix_str_to_rfc3339(ts);
    }
    msg.contact_name = contact_names.get(from).map(|s| s.to_string());
    if let Some(reply_to) = message.pointer("/context/id").and_then(|v| v.as_str()) {
        msg.metadata
            .insert("reply_to".into(), Value::String(reply_to.to_string()));
    }

    match kind {
        "text" => {
            msg.text = message
                .pointer("/text/body")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }
        "image" | "video" | "audio" | "document" => {
            let media = message.get(kind)?;
            msg.text = media
                .get("caption")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            msg.media_type = media
                .get("mime_type")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| Some(kind.to_string()));
            // Inbound Cloud API media is referenced by id, not URL; the
            // media id is passed through for the collaborator to fetch.
            if let Some(link) = media.get("link").and_then(|v| v.as_str()) {
                msg.media_url = Some(link.to_string());
            }
            if let Some(media_id) = media.get("id").and_then(|v| v.as_str()) {
                msg.metadata
                    .insert("media_id".into(), Value::String(media_id.to_string()));
            }
        }
        // Reactions, system notifications, and anything newer than this
        // mapping are dropped, not errors.
        _ => return None,
    }
    Some(msg)
}

fn status_update(phone_number_id: &str, status: &Value) -> Option<UnifiedMessage> {
    let wamid = status.get("id")?.as_str()?;
    let state: DeliveryStatus = status.get("status")?.as_str()?.parse().ok()?;
    let recipient = status
        .get("recipient_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let mut update = UnifiedMessage::outbound(
        ChannelType::WhatsApp,
        phone_number_id,
        format!("{wamid}#{}", state.as_str()),
        phone_number_id,
        recipient,
    );
    if let Some(ts) = status.get("timestamp").and_then(|v| v.as_str()) {
        update.timestamp = ucm_core::unix_str_to_rfc3339(ts);
    }
    update.status = Some(state);
    update
        .metadata
        .insert("status_for".into(), Value::String(wamid.to_string()));
    update.conversation_external_id = status
        .pointer("/conversation/id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(update)
}
