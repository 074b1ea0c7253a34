//! Outbound dispatcher: resolves the connection's connector and drives the
//! send with classified retries.
//!
//! Only `ProviderUnavailable` is retried. Terminal rejections and inactive
//! connections surface immediately so callers can prompt a reconnect or
//! report the failure instead of burning attempts.

use std::sync::Arc;

use tokio::time::{Duration, Instant, sleep};
use tracing::warn;

use ucm_connectors::ConnectorRegistry;
use ucm_core::{ConnectorError, ConnectorResult, OutgoingMessage, SharedConnectionStore};

/// Retry envelope for one dispatch. Backoff doubles per attempt; a provider
/// backoff hint overrides the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32, hint_ms: Option<u64>) -> Duration {
        match hint_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.base_backoff * 2u32.pow(attempt),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ConnectorRegistry>,
    connections: SharedConnectionStore,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectorRegistry>, connections: SharedConnectionStore) -> Self {
        Self {
            registry,
            connections,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sends through the connection's channel and returns the provider
    /// message id. `deadline` bounds the whole dispatch including backoff
    /// sleeps; a retry that cannot finish in time is abandoned and the last
    /// provider error returned.
    pub async fn dispatch(
        &self,
        connection_id: &str,
        message: &OutgoingMessage,
        deadline: Option<Instant>,
    ) -> ConnectorResult<String> {
        let connection = self
            .connections
            .get(connection_id)
            .await?
            .ok_or_else(|| ConnectorError::ConnectionNotFound(connection_id.to_string()))?;
        let connector = self.registry.get(connection.channel)?;
        let channel = connection.channel.as_str();

        let mut attempt = 0;
        loop {
            match connector.send_message(connection_id, message).await {
                Ok(provider_message_id) => {
                    metrics::counter!("outbound_sent", "channel" => channel).increment(1);
                    return Ok(provider_message_id);
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let backoff = self.policy.backoff_for(attempt, err.retry_after_ms());
                    if let Some(deadline) = deadline {
                        if Instant::now() + backoff >= deadline {
                            warn!(%connection_id, channel, "dispatch abandoned at deadline");
                            return Err(err);
                        }
                    }
                    attempt += 1;
                    warn!(%connection_id, channel, attempt, ?backoff, %err, "send failed, retrying");
                    metrics::counter!("outbound_retry", "channel" => channel).increment(1);
                    sleep(backoff).await;
                }
                Err(err) => {
                    metrics::counter!("outbound_failed", "channel" => channel).increment(1);
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ucm_core::{
        ChannelConnection, ChannelType, ConnectionStatus, ConnectionStore, InMemoryConnectionStore,
        UnifiedMessage,
    };

    /// Plays back a script of send outcomes and counts attempts.
    struct ScriptedConnector {
        channel: ChannelType,
        script: Mutex<Vec<ConnectorResult<String>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(channel: ChannelType, script: Vec<ConnectorResult<String>>) -> Self {
            Self {
                channel,
                script: Mutex::new(script),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ucm_connectors::ChannelConnector for ScriptedConnector {
        fn channel(&self) -> ChannelType {
            self.channel
        }
        async fn start_auth(
            &self,
            _tenant_id: &str,
            _return_url: Option<&str>,
        ) -> ConnectorResult<ucm_connectors::AuthStart> {
            unimplemented!()
        }
        async fn handle_callback(
            &self,
            _params: ucm_connectors::CallbackParams,
        ) -> ConnectorResult<String> {
            unimplemented!()
        }
        async fn get_status(&self, _connection_id: &str) -> ConnectorResult<ConnectionStatus> {
            unimplemented!()
        }
        fn ingest_webhook(&self, _payload: &serde_json::Value) -> Vec<UnifiedMessage> {
            Vec::new()
        }
        async fn send_message(
            &self,
            _connection_id: &str,
            _message: &OutgoingMessage,
        ) -> ConnectorResult<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().remove(0)
        }
        async fn disconnect(&self, _connection_id: &str) -> ConnectorResult<()> {
            unimplemented!()
        }
    }

    async fn dispatcher_with(
        script: Vec<ConnectorResult<String>>,
    ) -> (Dispatcher, Arc<ScriptedConnector>, String) {
        let connector = Arc::new(ScriptedConnector::new(ChannelType::WhatsApp, script));
        let registry = Arc::new(ConnectorRegistry::new().with(connector.clone()));
        let connections = Arc::new(InMemoryConnectionStore::new());
        let connection = ChannelConnection::new("acme", ChannelType::WhatsApp);
        connections.put(&connection).await.unwrap();
        let dispatcher = Dispatcher::new(registry, connections).with_policy(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        });
        (dispatcher, connector, connection.id)
    }

    fn transient(hint_ms: Option<u64>) -> ConnectorError {
        ConnectorError::ProviderUnavailable {
            message: "503".into(),
            retry_after_ms: hint_ms,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let (dispatcher, connector, id) = dispatcher_with(vec![
            Err(transient(None)),
            Err(transient(None)),
            Ok("wamid.OK".into()),
        ])
        .await;
        let sent = dispatcher
            .dispatch(&id, &OutgoingMessage::text("15551234567", "hi"), None)
            .await
            .unwrap();
        assert_eq!(sent, "wamid.OK");
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let (dispatcher, connector, id) = dispatcher_with(vec![
            Err(transient(None)),
            Err(transient(None)),
            Err(transient(None)),
        ])
        .await;
        let err = dispatcher
            .dispatch(&id, &OutgoingMessage::text("15551234567", "hi"), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_rejection_is_never_retried() {
        let (dispatcher, connector, id) =
            dispatcher_with(vec![Err(ConnectorError::rejected(400, "bad recipient"))]).await;
        let err = dispatcher
            .dispatch(&id, &OutgoingMessage::text("nope", "hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ProviderRejected { status: 400, .. }));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inactive_connection_is_never_retried() {
        let (dispatcher, connector, id) = dispatcher_with(vec![Err(
            ConnectorError::ConnectionNotActive("token expired".into()),
        )])
        .await;
        let err = dispatcher
            .dispatch(&id, &OutgoingMessage::text("15551234567", "hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionNotActive(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_abandons_instead_of_sleeping_past_it() {
        // Backoff hint is far beyond the deadline, so the retry is abandoned
        // after the first attempt.
        let (dispatcher, connector, id) =
            dispatcher_with(vec![Err(transient(Some(60_000))), Ok("unreached".into())]).await;
        let deadline = Instant::now() + Duration::from_millis(10);
        let err = dispatcher
            .dispatch(
                &id,
                &OutgoingMessage::text("15551234567", "hi"),
                Some(deadline),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_connection_is_reported() {
        let (dispatcher, _, _) = dispatcher_with(vec![]).await;
        assert!(matches!(
            dispatcher
                .dispatch("missing", &OutgoingMessage::text("x", "hi"), None)
                .await,
            Err(ConnectorError::ConnectionNotFound(_))
        ));
    }
}
