use thiserror::Error;

/// Classified errors emitted by connectors and the surfaces composed on top
/// of them. The taxonomy is part of the contract: callers branch on the
/// variant (prompt reconnect, surface terminal failure, retry with backoff),
/// never on message text.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Provider app credentials are missing for this deployment. Fatal at
    /// startup for that provider, not per request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// OAuth state token was replayed, expired, or forged.
    #[error("invalid oauth state: {0}")]
    InvalidOAuthState(String),

    /// The provider returned an error on the authorization redirect.
    #[error("provider auth error: {0}")]
    ProviderAuth(String),

    /// The code-for-token exchange failed.
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// Asset id is not among those the token can access.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// No connector is registered for this channel in the deployment.
    #[error("channel not registered: {0}")]
    ChannelNotRegistered(&'static str),

    /// No connection with the given id exists.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// Connection exists but its token is missing, expired, or disabled.
    #[error("connection not active: {0}")]
    ConnectionNotActive(String),

    /// Terminal provider rejection (4xx): bad recipient, policy violation.
    /// Never retried.
    #[error("provider rejected request (status {status}): {message}")]
    ProviderRejected { status: u16, message: String },

    /// Transient provider failure (5xx, timeout, rate limit). Retryable by
    /// the caller, optionally with a backoff hint in milliseconds.
    #[error("provider unavailable: {message}")]
    ProviderUnavailable {
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// The connector does not implement this optional capability.
    #[error("unsupported operation for {channel}: {operation}")]
    Unsupported {
        channel: &'static str,
        operation: &'static str,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        ConnectorError::ProviderUnavailable {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        ConnectorError::ProviderRejected {
            status,
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::ProviderUnavailable { .. })
    }

    /// Optional backoff hint in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ConnectorError::ProviderUnavailable { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Maps a provider HTTP response status to the retryable/terminal split.
    pub fn from_provider_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        if status == 429 || status >= 500 {
            ConnectorError::ProviderUnavailable {
                message: format!("status={status} body={message}"),
                retry_after_ms: None,
            }
        } else {
            ConnectorError::ProviderRejected { status, message }
        }
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
