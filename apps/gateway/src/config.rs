//! Environment-driven configuration, one block per provider.

use ucm_connectors::OAuthApp;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

/// Meta-backed provider settings: app credentials plus the webhook secrets.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub app_id: String,
    pub app_secret: String,
    pub redirect_url: String,
    /// Token echoed back during the `GET` subscription handshake.
    pub verify_token: String,
    pub auth_base: String,
    pub api_base: String,
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    fn from_env(prefix: &str, scopes: &[&str]) -> Self {
        Self {
            app_id: env_opt(&format!("{prefix}_APP_ID")),
            app_secret: env_opt(&format!("{prefix}_APP_SECRET")),
            redirect_url: env_opt(&format!("{prefix}_REDIRECT_URL")),
            verify_token: env_or(&format!("{prefix}_VERIFY_TOKEN"), "changeme"),
            auth_base: env_or(
                &format!("{prefix}_AUTH_BASE"),
                "https://www.facebook.com/v19.0/dialog/oauth",
            ),
            api_base: env_or(
                &format!("{prefix}_API_BASE"),
                "https://graph.facebook.com/v19.0",
            ),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn oauth_app(&self) -> OAuthApp {
        OAuthApp {
            client_id: self.app_id.clone(),
            client_secret: self.app_secret.clone(),
            redirect_url: self.redirect_url.clone(),
            auth_base: self.auth_base.clone(),
            api_base: self.api_base.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// First-party widget settings; no provider OAuth involved.
#[derive(Debug, Clone)]
pub struct WebChatConfig {
    /// Secret the widget signs webhook bodies with.
    pub secret: String,
    pub verify_token: String,
    pub setup_url: String,
    pub delivery_base: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub state_secret: String,
    pub dedup_ttl_hours: u64,
    pub whatsapp: ProviderConfig,
    pub facebook: ProviderConfig,
    pub instagram: ProviderConfig,
    pub webchat: WebChatConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            bind: env_or("BIND", "0.0.0.0:8090"),
            state_secret: env_or("STATE_SECRET", "dev-state-secret"),
            dedup_ttl_hours: env_or("DEDUP_TTL_HOURS", "48").parse().unwrap_or(48),
            whatsapp: ProviderConfig::from_env(
                "WHATSAPP",
                &["whatsapp_business_management", "whatsapp_business_messaging"],
            ),
            facebook: ProviderConfig::from_env("FACEBOOK", &["pages_messaging", "pages_show_list"]),
            instagram: ProviderConfig::from_env(
                "INSTAGRAM",
                &["instagram_manage_messages", "pages_show_list"],
            ),
            webchat: WebChatConfig {
                secret: env_or("WEBCHAT_APP_SECRET", "dev-webchat-secret"),
                verify_token: env_or("WEBCHAT_VERIFY_TOKEN", "changeme"),
                setup_url: env_or("WEBCHAT_SETUP_URL", "http://localhost:8090/webchat/setup"),
                delivery_base: env_or("WEBCHAT_DELIVERY_BASE", "http://localhost:8091"),
            },
        }
    }
}
