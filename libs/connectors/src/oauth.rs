//! OAuth flow plumbing shared by the Meta-backed connectors.
//!
//! State machine: `start_auth` issues a signed single-use state; the
//! callback consumes it, exchanges the code, and leaves the connection
//! `Pending` (asset selection outstanding) or `Active`. Token refresh is
//! single-flight per connection.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use ucm_core::{ConnectorError, ConnectorResult, ProviderToken};
use ucm_security::{
    STATE_TTL, SharedNonceStore, StateClaims, sign_state, verify_state,
};

use crate::connector::{AuthStart, CallbackParams};

/// Provider app credentials and endpoints for one deployment.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    /// Base of the user-facing authorization dialog.
    pub auth_base: String,
    /// Base of the token/Graph API, `mock://` in tests.
    pub api_base: String,
    pub scopes: Vec<String>,
}

impl OAuthApp {
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// Provider token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn into_provider_token(self) -> ProviderToken {
        let expires_at = self
            .expires_in
            .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs));
        ProviderToken {
            access_token: self.access_token,
            refresh_token: None,
            expires_at,
        }
    }
}

/// Seam over the provider's token endpoint so tests can count and fake
/// exchanges without a network.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_code(&self, app: &OAuthApp, code: &str) -> ConnectorResult<TokenResponse>;

    /// Trades a short-lived token for a long-lived one
    /// (`fb_exchange_token`); also used for refresh.
    async fn extend_token(&self, app: &OAuthApp, token: &str) -> ConnectorResult<TokenResponse>;
}

/// Real exchanger backed by reqwest. An `api_base` starting with `mock://`
/// short-circuits to canned tokens, the pattern used throughout the tests.
pub struct HttpExchanger {
    http: reqwest::Client,
}

impl HttpExchanger {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn get_token(&self, url: String) -> ConnectorResult<TokenResponse> {
        let response = self.http.get(&url).send().await.map_err(net_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::TokenExchangeFailed(format!(
                "status={} body={}",
                status.as_u16(),
                body
            )));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|err| ConnectorError::TokenExchangeFailed(err.to_string()))
    }
}

#[async_trait]
impl TokenExchanger for HttpExchanger {
    async fn exchange_code(&self, app: &OAuthApp, code: &str) -> ConnectorResult<TokenResponse> {
        if app.api_base.starts_with("mock://") {
            return Ok(TokenResponse {
                access_token: format!("mock-token-{code}"),
                expires_in: Some(5_184_000),
            });
        }
        let url = format!(
            "{}/oauth/access_token?client_id={}&client_secret={}&redirect_uri={}&code={}",
            app.api_base.trim_end_matches('/'),
            urlencoding::encode(&app.client_id),
            urlencoding::encode(&app.client_secret),
            urlencoding::encode(&app.redirect_url),
            urlencoding::encode(code),
        );
        self.get_token(url).await
    }

    async fn extend_token(&self, app: &OAuthApp, token: &str) -> ConnectorResult<TokenResponse> {
        if app.api_base.starts_with("mock://") {
            return Ok(TokenResponse {
                access_token: "mock-long-lived-token".into(),
                expires_in: Some(5_184_000),
            });
        }
        let url = format!(
            "{}/oauth/access_token?grant_type=fb_exchange_token&client_id={}&client_secret={}&fb_exchange_token={}",
            app.api_base.trim_end_matches('/'),
            urlencoding::encode(&app.client_id),
            urlencoding::encode(&app.client_secret),
            urlencoding::encode(token),
        );
        self.get_token(url).await
    }
}

fn net_error(err: reqwest::Error) -> ConnectorError {
    ConnectorError::ProviderUnavailable {
        message: err.to_string(),
        retry_after_ms: Some(1_000),
    }
}

/// Issues and validates state tokens and drives the code exchange for one
/// provider app.
pub struct OAuthFlow {
    app: OAuthApp,
    state_secret: String,
    nonces: SharedNonceStore,
    exchanger: Arc<dyn TokenExchanger>,
}

impl OAuthFlow {
    pub fn new(app: OAuthApp, state_secret: impl Into<String>, nonces: SharedNonceStore) -> Self {
        Self {
            app,
            state_secret: state_secret.into(),
            nonces,
            exchanger: Arc::new(HttpExchanger::new(reqwest::Client::new())),
        }
    }

    pub fn with_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = exchanger;
        self
    }

    pub fn app(&self) -> &OAuthApp {
        &self.app
    }

    /// Builds the provider authorization URL with a fresh signed state.
    pub fn start(&self, tenant_id: &str, return_url: Option<&str>) -> ConnectorResult<AuthStart> {
        if !self.app.is_configured() {
            return Err(ConnectorError::Configuration(
                "provider app credentials are not configured".into(),
            ));
        }
        let claims = StateClaims::new(tenant_id, return_url.map(str::to_string), STATE_TTL);
        let state = sign_state(&claims, &self.state_secret)
            .map_err(|err| ConnectorError::Internal(err))?;
        let auth_url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&response_type=code&state={}",
            self.app.auth_base.trim_end_matches('/'),
            urlencoding::encode(&self.app.client_id),
            urlencoding::encode(&self.app.redirect_url),
            urlencoding::encode(&self.app.scopes.join(",")),
            state,
        );
        Ok(AuthStart { auth_url, state })
    }

    /// Validates and consumes the callback state. Provider-reported errors
    /// map to `ProviderAuth`; forged, expired, or replayed states map to
    /// `InvalidOAuthState`. Consumption is atomic check-and-invalidate.
    pub async fn consume_callback_state(
        &self,
        params: &CallbackParams,
    ) -> ConnectorResult<StateClaims> {
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
        Ok(claims)
    }

    pub async fn exchange_code(&self, code: &str) -> ConnectorResult<TokenResponse> {
        self.exchanger.exchange_code(&self.app, code).await
    }

    pub async fn extend_token(&self, token: &str) -> ConnectorResult<TokenResponse> {
        self.exchanger.extend_token(&self.app, token).await
    }
}

/// Tokens refreshed this recently are reused instead of triggering another
/// provider call; concurrent refreshers that lose the lock race see a fresh
/// expiry and return early.
pub const REFRESH_FRESHNESS: Duration = Duration::hours(1);

/// Serializes token refresh per connection id.
#[derive(Default)]
pub struct RefreshCoordinator {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, connection_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Whether a token with this expiry still counts as freshly refreshed.
    pub fn is_fresh(expires_at: Option<OffsetDateTime>) -> bool {
        match expires_at {
            Some(expires_at) => expires_at > OffsetDateTime::now_utc() + REFRESH_FRESHNESS,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucm_security::InMemoryNonceStore;

    fn app() -> OAuthApp {
        OAuthApp {
            client_id: "app-id".into(),
            client_secret: "app-secret".into(),
            redirect_url: "https://ucm.example/oauth/facebook/callback".into(),
            auth_base: "https://www.facebook.com/v19.0/dialog/oauth".into(),
            api_base: "mock://graph".into(),
            scopes: vec!["pages_messaging".into()],
        }
    }

    fn flow() -> OAuthFlow {
        OAuthFlow::new(app(), "state-secret", Arc::new(InMemoryNonceStore::new()))
    }

    #[test]
    fn start_embeds_state_and_fails_without_credentials() {
        let started = flow().start("acme", Some("https://app.example/done")).unwrap();
        assert!(started.auth_url.contains("client_id=app-id"));
        assert!(started.auth_url.contains(&format!("state={}", started.state)));

        let mut unconfigured = app();
        unconfigured.client_id.clear();
        let flow = OAuthFlow::new(unconfigured, "s", Arc::new(InMemoryNonceStore::new()));
        assert!(matches!(
            flow.start("acme", None),
            Err(ConnectorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn callback_state_is_single_use() {
        let flow = flow();
        let started = flow.start("acme", None).unwrap();
        let params = CallbackParams {
            code: Some("abc".into()),
            state: started.state.clone(),
            ..Default::default()
        };

        let claims = flow.consume_callback_state(&params).await.unwrap();
        assert_eq!(claims.sub, "acme");

        // Replaying the same {code, state} pair fails even though the token
        // itself has not expired.
        assert!(matches!(
            flow.consume_callback_state(&params).await,
            Err(ConnectorError::InvalidOAuthState(_))
        ));
    }

    #[tokio::test]
    async fn provider_error_maps_to_provider_auth() {
        let flow = flow();
        let started = flow.start("acme", None).unwrap();
        let params = CallbackParams {
            code: None,
            state: started.state,
            error: Some("access_denied".into()),
            error_description: Some("user declined".into()),
        };
        match flow.consume_callback_state(&params).await {
            Err(ConnectorError::ProviderAuth(detail)) => assert_eq!(detail, "user declined"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forged_state_is_rejected() {
        let flow = flow();
        let params = CallbackParams {
            code: Some("abc".into()),
            state: "not-a-jwt".into(),
            ..Default::default()
        };
        assert!(matches!(
            flow.consume_callback_state(&params).await,
            Err(ConnectorError::InvalidOAuthState(_))
        ));
    }

    #[tokio::test]
    async fn mock_exchange_returns_long_lived_token() {
        let token = flow().exchange_code("abc").await.unwrap();
        assert_eq!(token.access_token, "mock-token-abc");
        let provider_token = token.into_provider_token();
        assert!(provider_token.expires_at.unwrap() > OffsetDateTime::now_utc());
    }

    #[test]
    fn freshness_window() {
        assert!(!RefreshCoordinator::is_fresh(None));
        assert!(!RefreshCoordinator::is_fresh(Some(
            OffsetDateTime::now_utc() + Duration::minutes(5)
        )));
        assert!(RefreshCoordinator::is_fresh(Some(
            OffsetDateTime::now_utc() + Duration::days(30)
        )));
    }
}
