//! SMTP email transport — outbound via lettre.
//!
//! Default implementation of the `EmailTransport` collaborator for
//! deployments that speak SMTP directly. The send acknowledgment from the
//! relay is what makes a delivery "confirmed"; building the message is not
//! enough.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::collab::{EmailTransport, TransportReceipt};
use crate::error::ChannelError;

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `SMTP_HOST` is not set (transport disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Email transport over SMTP.
pub struct SmtpEmailTransport {
    config: SmtpConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<(), ChannelError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| ChannelError::SendFailed {
                channel: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                ChannelError::SendFailed {
                    channel: "email".into(),
                    reason: format!("Invalid from address: {e}"),
                }
            })?)
            .to(to.parse().map_err(|_| ChannelError::InvalidRecipient {
                channel: "email".into(),
                target: to.to_string(),
            })?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| ChannelError::SendFailed {
                channel: "email".into(),
                reason: format!("Failed to build email: {e}"),
            })?;

        transport.send(&email).map_err(|e| ChannelError::SendFailed {
            channel: "email".into(),
            reason: format!("SMTP send failed: {e}"),
        })?;

        tracing::info!("Email sent to {to}");
        Ok(())
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<TransportReceipt, ChannelError> {
        let config = self.config.clone();
        let to = to.to_string();
        let subject = subject.to_string();
        let body = body.to_string();

        // lettre's sync transport blocks on the socket; keep it off the
        // async executor threads.
        tokio::task::spawn_blocking(move || {
            Self::send_blocking(&config, &to, &subject, &body)
        })
        .await
        .map_err(|e| ChannelError::SendFailed {
            channel: "email".into(),
            reason: format!("send task panicked: {e}"),
        })??;

        Ok(TransportReceipt {
            provider_message_id: None,
        })
    }
}
