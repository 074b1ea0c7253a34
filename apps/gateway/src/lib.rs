//! Gateway wiring: composes the connector registry, dispatcher, router,
//! and dedup guard over swappable collaborator stores.

pub mod config;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use ucm_connectors::{
    ConnectorContext, ConnectorRegistry, FacebookConnector, HttpGraphClient, InstagramConnector,
    OAuthFlow, WebChatConnector, WhatsAppConnector,
};
use ucm_core::{
    AccountRouter, ChannelType, InMemoryConnectionStore, InMemoryConversationStore,
    InMemoryMappingStore, InMemoryTokenStore, LogEventPublisher, MappingStore,
    SharedConnectionStore, SharedConversationStore, SharedEventPublisher, SharedTokenStore,
};
use ucm_dedup::{DedupGuard, InMemoryDedupStore, SharedDedupStore};
use ucm_dispatch::Dispatcher;
use ucm_security::{InMemoryNonceStore, SharedNonceStore};

use crate::config::GatewayConfig;

/// External collaborators the gateway composes over. Swapped for in-memory
/// implementations in tests and single-process deployments.
#[derive(Clone)]
pub struct Collaborators {
    pub connections: SharedConnectionStore,
    pub tokens: SharedTokenStore,
    pub mappings: Arc<dyn MappingStore>,
    pub conversations: SharedConversationStore,
    pub events: SharedEventPublisher,
    pub dedup: SharedDedupStore,
    pub nonces: SharedNonceStore,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            connections: Arc::new(InMemoryConnectionStore::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
            mappings: Arc::new(InMemoryMappingStore::new()),
            conversations: Arc::new(InMemoryConversationStore::new()),
            events: Arc::new(LogEventPublisher),
            dedup: Arc::new(InMemoryDedupStore::new()),
            nonces: Arc::new(InMemoryNonceStore::new()),
        }
    }
}

/// Per-channel webhook authentication material.
#[derive(Clone)]
pub struct WebhookAuth {
    pub secret: String,
    pub verify_token: String,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectorRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub router: AccountRouter,
    pub dedup: DedupGuard,
    pub connections: SharedConnectionStore,
    pub conversations: SharedConversationStore,
    pub events: SharedEventPublisher,
    pub webhook_auth: Arc<HashMap<ChannelType, WebhookAuth>>,
}

pub fn build_state(config: &GatewayConfig, collab: Collaborators) -> AppState {
    let ctx = ConnectorContext {
        connections: collab.connections.clone(),
        tokens: collab.tokens.clone(),
        mappings: collab.mappings.clone(),
        events: collab.events.clone(),
    };
    let graph = Arc::new(HttpGraphClient::new(reqwest::Client::new()));

    let registry = Arc::new(
        ConnectorRegistry::new()
            .with(Arc::new(WhatsAppConnector::new(
                ctx.clone(),
                OAuthFlow::new(
                    config.whatsapp.oauth_app(),
                    &config.state_secret,
                    collab.nonces.clone(),
                ),
                graph.clone(),
            )))
            .with(Arc::new(FacebookConnector::new(
                ctx.clone(),
                OAuthFlow::new(
                    config.facebook.oauth_app(),
                    &config.state_secret,
                    collab.nonces.clone(),
                ),
                graph.clone(),
            )))
            .with(Arc::new(InstagramConnector::new(
                ctx.clone(),
                OAuthFlow::new(
                    config.instagram.oauth_app(),
                    &config.state_secret,
                    collab.nonces.clone(),
                ),
                graph.clone(),
            )))
            .with(Arc::new(WebChatConnector::new(
                ctx.clone(),
                &config.state_secret,
                collab.nonces.clone(),
                &config.webchat.setup_url,
                &config.webchat.delivery_base,
                graph,
            ))),
    );

    let webhook_auth = HashMap::from([
        (
            ChannelType::WhatsApp,
            WebhookAuth {
                secret: config.whatsapp.app_secret.clone(),
                verify_token: config.whatsapp.verify_token.clone(),
            },
        ),
        (
            ChannelType::Facebook,
            WebhookAuth {
                secret: config.facebook.app_secret.clone(),
                verify_token: config.facebook.verify_token.clone(),
            },
        ),
        (
            ChannelType::Instagram,
            WebhookAuth {
                secret: config.instagram.app_secret.clone(),
                verify_token: config.instagram.verify_token.clone(),
            },
        ),
        (
            ChannelType::WebChat,
            WebhookAuth {
                secret: config.webchat.secret.clone(),
                verify_token: config.webchat.verify_token.clone(),
            },
        ),
    ]);

    AppState {
        dispatcher: Arc::new(Dispatcher::new(
            registry.clone(),
            collab.connections.clone(),
        )),
        registry,
        router: AccountRouter::new(collab.mappings),
        dedup: DedupGuard::new(collab.dedup, config.dedup_ttl_hours),
        connections: collab.connections,
        conversations: collab.conversations,
        events: collab.events,
        webhook_auth: Arc::new(webhook_auth),
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/webhooks/{provider}",
            get(http::verify_webhook).post(http::receive_webhook),
        )
        .route("/oauth/{provider}/start", get(http::oauth_start))
        .route("/oauth/{provider}/callback", get(http::oauth_callback))
        .route("/oauth/{provider}/select-asset", post(http::select_asset))
        .route("/send", post(http::send_message))
        .route("/connections/{id}/status", get(http::connection_status))
        .route("/connections/{id}/disconnect", post(http::disconnect))
        .route("/healthz", get(http::healthz))
        .with_state(state)
}
