//! SMS transport — HTTP webhook to the provider.
//!
//! Default implementation of the `SmsTransport` collaborator: POSTs JSON
//! to a provider endpoint and treats a 2xx with a message id as confirmed
//! acceptance. Rate limits map to a retryable error so the scheduler's
//! next pass retries.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::collab::{SmsTransport, TransportReceipt};
use crate::error::ChannelError;

/// SMS provider configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    /// Provider webhook URL, e.g. `https://api.provider.test/v1/messages`.
    pub endpoint: String,
    pub api_key: SecretString,
    /// Sender number or alphanumeric id.
    pub from: String,
}

impl SmsConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMS_ENDPOINT` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("SMS_ENDPOINT").ok()?;
        let api_key = SecretString::from(std::env::var("SMS_API_KEY").unwrap_or_default());
        let from = std::env::var("SMS_FROM").unwrap_or_default();

        Some(Self {
            endpoint,
            api_key,
            from,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    message_id: Option<String>,
}

/// SMS transport over a provider HTTP API.
pub struct WebhookSmsTransport {
    config: SmsConfig,
    client: reqwest::Client,
}

impl WebhookSmsTransport {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SmsTransport for WebhookSmsTransport {
    async fn send(&self, to: &str, body: &str) -> Result<TransportReceipt, ChannelError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&serde_json::json!({
                "from": self.config.from,
                "to": to,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ChannelError::RateLimited {
                channel: "sms".into(),
            });
        }
        if status.as_u16() == 400 || status.as_u16() == 422 {
            return Err(ChannelError::InvalidRecipient {
                channel: "sms".into(),
                target: to.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ChannelError::SendFailed {
                channel: "sms".into(),
                reason: format!("provider returned {status}"),
            });
        }

        let parsed: ProviderResponse = response.json().await.unwrap_or(ProviderResponse {
            message_id: None,
        });

        tracing::info!("SMS sent to {to}");
        Ok(TransportReceipt {
            provider_message_id: parsed.message_id,
        })
    }
}
