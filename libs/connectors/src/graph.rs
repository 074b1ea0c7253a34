//! Thin seam over provider HTTP APIs (the Meta Graph API and the webchat
//! delivery endpoint). Connectors depend on the trait so tests can fake
//! provider behavior; the real client maps HTTP failures onto the
//! retryable/terminal error split.

use async_trait::async_trait;
use serde_json::{Value, json};

use ucm_core::{ConnectorError, ConnectorResult};

#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn get(&self, url: &str, access_token: &str) -> ConnectorResult<Value>;
    async fn post(&self, url: &str, access_token: &str, body: &Value) -> ConnectorResult<Value>;
}

pub struct HttpGraphClient {
    http: reqwest::Client,
}

impl HttpGraphClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Canned responses for `mock://` bases, keyed on the path shape the
    /// connectors request.
    fn mock_response(url: &str) -> Value {
        if url.contains("/me/phone_numbers") {
            json!({
                "data": [
                    {
                        "id": "966520989876579",
                        "display_phone_number": "+966 52 098 9876",
                        "verified_name": "Acme Support"
                    }
                ]
            })
        } else if url.contains("/me/accounts") {
            json!({
                "data": [
                    {
                        "id": "page-1",
                        "name": "Acme Page",
                        "access_token": "mock-page-token",
                        "instagram_business_account": {
                            "id": "ig-1",
                            "username": "acme"
                        }
                    }
                ]
            })
        } else if url.contains("/messages") {
            let id = uuid::Uuid::new_v4().simple().to_string();
            json!({
                "messages": [ { "id": format!("mock:wamid.{id}") } ],
                "message_id": format!("mock:mid.{id}")
            })
        } else {
            Value::Null
        }
    }

    async fn decode(response: reqwest::Response) -> ConnectorResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::from_provider_status(status.as_u16(), body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| ConnectorError::unavailable(err.to_string()))
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn get(&self, url: &str, access_token: &str) -> ConnectorResult<Value> {
        if url.starts_with("mock://") {
            return Ok(Self::mock_response(url));
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(net_error)?;
        Self::decode(response).await
    }

    async fn post(&self, url: &str, access_token: &str, body: &Value) -> ConnectorResult<Value> {
        if url.starts_with("mock://") {
            return Ok(Self::mock_response(url));
        }
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await
            .map_err(net_error)?;
        Self::decode(response).await
    }
}

fn net_error(err: reqwest::Error) -> ConnectorError {
    ConnectorError::ProviderUnavailable {
        message: err.to_string(),
        retry_after_ms: Some(1_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_base_serves_canned_assets_and_message_ids() {
        let client = HttpGraphClient::new(reqwest::Client::new());
        let phones = client
            .get("mock://graph/v19.0/me/phone_numbers", "tok")
            .await
            .unwrap();
        assert_eq!(phones["data"][0]["id"], "966520989876579");

        let sent = client
            .post("mock://graph/v19.0/123/messages", "tok", &json!({}))
            .await
            .unwrap();
        assert!(sent["messages"][0]["id"].as_str().unwrap().starts_with("mock:wamid."));
    }
}
