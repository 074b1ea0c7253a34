//! HTTP handlers for the webhook, OAuth, and send surfaces.

use std::collections::BTreeMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use ucm_connectors::CallbackParams;
use ucm_core::{ChannelType, ConnectorError, DomainEvent, OutgoingMessage, RoutedMessage};
use ucm_dedup::DedupKey;
use ucm_security::verify_signature;

use crate::AppState;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

fn channel_from_path(provider: &str) -> Result<ChannelType, Response> {
    provider.parse::<ChannelType>().map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown provider: {provider}") })),
        )
            .into_response()
    })
}

/// Maps the connector error taxonomy onto HTTP statuses for the management
/// surface. Webhook handlers never use this: providers always get `200` once
/// the signature passed.
fn error_response(err: ConnectorError) -> Response {
    let status = match &err {
        ConnectorError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ConnectorError::InvalidOAuthState(_) => StatusCode::BAD_REQUEST,
        ConnectorError::ProviderAuth(_) => StatusCode::BAD_GATEWAY,
        ConnectorError::TokenExchangeFailed(_) => StatusCode::BAD_GATEWAY,
        ConnectorError::ChannelNotRegistered(_) => StatusCode::NOT_FOUND,
        ConnectorError::AssetNotFound(_) => StatusCode::NOT_FOUND,
        ConnectorError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
        ConnectorError::ConnectionNotActive(_) => StatusCode::CONFLICT,
        ConnectorError::ProviderRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ConnectorError::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
        ConnectorError::Unsupported { .. } => StatusCode::METHOD_NOT_ALLOWED,
        ConnectorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[derive(Deserialize)]
pub struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

/// `GET /webhooks/{provider}`: Meta-style subscription handshake.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<VerifyQs>,
) -> Response {
    let channel = match channel_from_path(&provider) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let Some(auth) = state.webhook_auth.get(&channel) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if q.mode.as_deref() == Some("subscribe") && q.token.as_deref() == Some(auth.verify_token.as_str())
    {
        (StatusCode::OK, q.challenge.unwrap_or_default()).into_response()
    } else {
        warn!(%provider, "webhook handshake rejected");
        (StatusCode::FORBIDDEN, "forbidden").into_response()
    }
}

/// `POST /webhooks/{provider}`: signature check over the raw body, then
/// normalize, route, dedup, persist, announce. Always `200` once the
/// signature passed, whatever routing and dedup decide.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel = match channel_from_path(&provider) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let Some(auth) = state.webhook_auth.get(&channel) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !verify_signature(&auth.secret, signature, &body) {
        warn!(channel = channel.as_str(), "webhook signature rejected");
        metrics::counter!("webhook_signature_rejected", "channel" => channel.as_str())
            .increment(1);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(channel = channel.as_str(), %err, "malformed webhook payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let connector = match state.registry.get(channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };

    for message in connector.ingest_webhook(&payload) {
        let Some(target) = state.router.resolve(channel, &message.channel_identifier) else {
            warn!(
                channel = channel.as_str(),
                channel_identifier = %message.channel_identifier,
                external_id = %message.external_id,
                "unrouted message dropped"
            );
            metrics::counter!("unrouted_dropped", "channel" => channel.as_str()).increment(1);
            continue;
        };

        let key = DedupKey::new(channel.as_str(), &message.external_id);
        match state.dedup.should_process(&key).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                // A dedup outage degrades to at-least-once rather than
                // dropping traffic.
                warn!(%key, %err, "dedup check failed; continuing");
            }
        }

        let external_id = message.external_id.clone();
        let routed = RoutedMessage {
            tenant_id: target.tenant_id.clone(),
            routing_key: target.routing_key,
            message,
        };
        if let Err(err) = state.conversations.append(&routed).await {
            tracing::error!(%external_id, %err, "failed to persist message");
            continue;
        }
        info!(
            tenant = %target.tenant_id,
            channel = channel.as_str(),
            external_id = %external_id,
            "message ingested"
        );
        metrics::counter!("inbound_stored", "channel" => channel.as_str()).increment(1);
        if let Err(err) = state
            .events
            .publish(DomainEvent::MessageReceived {
                tenant_id: target.tenant_id,
                channel: channel.as_str().to_string(),
                external_id,
            })
            .await
        {
            tracing::error!(%err, "failed to publish message event");
        }
    }

    (StatusCode::OK, "EVENT_RECEIVED").into_response()
}

#[derive(Deserialize)]
pub struct StartQs {
    tenant_id: String,
    #[serde(default)]
    return_url: Option<String>,
}

/// `GET /oauth/{provider}/start`
pub async fn oauth_start(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<StartQs>,
) -> Response {
    let channel = match channel_from_path(&provider) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let connector = match state.registry.get(channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };
    match connector
        .start_auth(&q.tenant_id, q.return_url.as_deref())
        .await
    {
        Ok(started) => Json(json!({
            "auth_url": started.auth_url,
            "state": started.state,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

/// `GET /oauth/{provider}/callback`
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let channel = match channel_from_path(&provider) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let connector = match state.registry.get(channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };
    match connector.handle_callback(params).await {
        Ok(connection_id) => {
            Json(json!({ "connection_id": connection_id })).into_response()
        }
        Err(err) => {
            warn!(channel = channel.as_str(), %err, "oauth callback failed");
            error_response(err)
        }
    }
}

#[derive(Deserialize)]
pub struct SelectAssetBody {
    connection_id: String,
    asset_id: String,
}

/// `POST /oauth/{provider}/select-asset`
pub async fn select_asset(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<SelectAssetBody>,
) -> Response {
    let channel = match channel_from_path(&provider) {
        Ok(channel) => channel,
        Err(resp) => return resp,
    };
    let connector = match state.registry.get(channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };
    match connector
        .select_asset(&body.connection_id, &body.asset_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
pub struct SendBody {
    connection_id: String,
    to: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    reply_to_message_id: Option<String>,
    /// Total time allowed for the dispatch including retries, in milliseconds.
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Provider-specific extras, merged verbatim into the outbound payload.
    #[serde(default)]
    options: BTreeMap<String, Value>,
}

impl SendBody {
    fn to_outgoing(&self) -> OutgoingMessage {
        let mut message = OutgoingMessage::text(&self.to, self.text.clone().unwrap_or_default());
        if message.text.as_deref() == Some("") {
            message.text = None;
        }
        message.media_url = self.media_url.clone();
        message.media_type = self.media_type.clone();
        message.reply_to_message_id = self.reply_to_message_id.clone();
        message.options = self.options.clone();
        message
    }
}

/// `POST /send`
pub async fn send_message(State(state): State<AppState>, Json(body): Json<SendBody>) -> Response {
    let message = body.to_outgoing();
    let deadline = body
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    match state
        .dispatcher
        .dispatch(&body.connection_id, &message, deadline)
        .await
    {
        Ok(provider_message_id) => {
            if let Ok(Some(connection)) = state.connections.get(&body.connection_id).await {
                if let Err(err) = state
                    .events
                    .publish(DomainEvent::MessageSent {
                        tenant_id: connection.tenant_id,
                        channel: connection.channel.as_str().to_string(),
                        external_id: provider_message_id.clone(),
                    })
                    .await
                {
                    tracing::error!(%err, "failed to publish send event");
                }
            }
            Json(json!({ "message_id": provider_message_id })).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// `GET /connections/{id}/status`
pub async fn connection_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let connection = match state.connections.get(&id).await {
        Ok(Some(connection)) => connection,
        Ok(None) => {
            return error_response(ConnectorError::ConnectionNotFound(id));
        }
        Err(err) => return error_response(err.into()),
    };
    let connector = match state.registry.get(connection.channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };
    match connector.get_status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(err),
    }
}

/// `POST /connections/{id}/disconnect`
pub async fn disconnect(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let connection = match state.connections.get(&id).await {
        Ok(Some(connection)) => connection,
        Ok(None) => {
            return error_response(ConnectorError::ConnectionNotFound(id));
        }
        Err(err) => return error_response(err.into()),
    };
    let connector = match state.registry.get(connection.channel) {
        Ok(connector) => connector,
        Err(err) => return error_response(err),
    };
    match connector.disconnect(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_body_carries_provider_options_onto_the_message() {
        let body: SendBody = serde_json::from_value(json!({
            "connection_id": "c-1",
            "to": "15551234567",
            "text": "order shipped",
            "options": { "biz_opaque_callback_data": "ref-77" }
        }))
        .unwrap();

        let message = body.to_outgoing();
        assert_eq!(message.text.as_deref(), Some("order shipped"));
        assert_eq!(
            message
                .options
                .get("biz_opaque_callback_data")
                .and_then(|v| v.as_str()),
            Some("ref-77")
        );
    }

    #[test]
    fn send_body_without_options_yields_an_empty_map() {
        let body: SendBody = serde_json::from_value(json!({
            "connection_id": "c-1",
            "to": "15551234567",
            "text": "hi"
        }))
        .unwrap();
        assert!(body.to_outgoing().options.is_empty());
    }
}
