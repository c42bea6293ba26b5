//! Delivery channel abstraction.
//!
//! A closed enum over the actions a rule can perform, with one uniform
//! `deliver()` contract. Adding a channel is a compile-time-checked
//! extension: the router matches exhaustively, so a new variant fails to
//! compile until every site handles it.

pub mod email;
pub mod sms;

pub use email::{SmtpConfig, SmtpEmailTransport};
pub use sms::{SmsConfig, WebhookSmsTransport};

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::collab::{
    EmailTransport, Pipeline, SmartFileSender, SmsTransport, SubjectDirectory, SubjectProfile,
};
use crate::error::ChannelError;

/// The action a rule performs when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Sms,
    /// Pipeline stage mutation.
    StateChange,
    /// Send a proposal/contract link.
    SmartFile,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Sms => write!(f, "sms"),
            ChannelKind::StateChange => write!(f, "state_change"),
            ChannelKind::SmartFile => write!(f, "smart_file"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(ChannelKind::Email),
            "sms" => Ok(ChannelKind::Sms),
            "state_change" => Ok(ChannelKind::StateChange),
            "smart_file" => Ok(ChannelKind::SmartFile),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Content after template lookup and merge-field rendering.
#[derive(Debug, Clone)]
pub struct ResolvedContent {
    /// Subject line, for channels that have one.
    pub subject: Option<String>,
    pub body: String,
}

/// One delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub tenant_id: Uuid,
    pub subject_id: Uuid,
    pub channel: ChannelKind,
    pub content: ResolvedContent,
    /// Target stage for `StateChange` deliveries.
    pub target_stage: Option<Uuid>,
}

/// Outcome of one delivery attempt.
///
/// `Delivered` means the collaborator confirmed acceptance, not merely that
/// the attempt was made. Both failure variants leave the item due; the split
/// only shapes the audit record.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered { provider_message_id: Option<String> },
    Retryable { error: String },
    Failed { error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    fn from_channel_error(err: ChannelError) -> Self {
        if err.is_permanent() {
            DeliveryOutcome::Failed {
                error: err.to_string(),
            }
        } else {
            DeliveryOutcome::Retryable {
                error: err.to_string(),
            }
        }
    }
}

/// Routes delivery requests to the configured collaborators.
///
/// Transports are optional: an unconfigured channel yields a permanent
/// failure recorded in the audit log, never a panic.
pub struct DeliveryRouter {
    email: Option<Arc<dyn EmailTransport>>,
    sms: Option<Arc<dyn SmsTransport>>,
    smart_files: Option<Arc<dyn SmartFileSender>>,
    pipeline: Arc<dyn Pipeline>,
    directory: Arc<dyn SubjectDirectory>,
}

impl DeliveryRouter {
    pub fn new(
        email: Option<Arc<dyn EmailTransport>>,
        sms: Option<Arc<dyn SmsTransport>>,
        smart_files: Option<Arc<dyn SmartFileSender>>,
        pipeline: Arc<dyn Pipeline>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Self {
        Self {
            email,
            sms,
            smart_files,
            pipeline,
            directory,
        }
    }

    /// Deliver one request. Never errors — every failure mode is folded into
    /// the outcome so the dispatcher can record it and move on.
    pub async fn deliver(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        debug!(
            channel = %request.channel,
            subject_id = %request.subject_id,
            "Dispatching delivery"
        );

        match request.channel {
            ChannelKind::Email => self.deliver_email(request).await,
            ChannelKind::Sms => self.deliver_sms(request).await,
            ChannelKind::StateChange => self.deliver_stage_change(request).await,
            ChannelKind::SmartFile => self.deliver_smart_file(request).await,
        }
    }

    async fn deliver_email(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let Some(transport) = &self.email else {
            return DeliveryOutcome::from_channel_error(ChannelError::NotConfigured {
                channel: "email".to_string(),
            });
        };

        let profile = match self.load_profile(request).await {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let Some(to) = profile.email.as_deref() else {
            return DeliveryOutcome::from_channel_error(ChannelError::MissingContactField {
                subject_id: request.subject_id,
                field: "email address".to_string(),
            });
        };

        let subject_line = request.content.subject.as_deref().unwrap_or("");
        match transport.send(to, subject_line, &request.content.body).await {
            Ok(receipt) => DeliveryOutcome::Delivered {
                provider_message_id: receipt.provider_message_id,
            },
            Err(e) => DeliveryOutcome::from_channel_error(e),
        }
    }

    async fn deliver_sms(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let Some(transport) = &self.sms else {
            return DeliveryOutcome::from_channel_error(ChannelError::NotConfigured {
                channel: "sms".to_string(),
            });
        };

        let profile = match self.load_profile(request).await {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let Some(to) = profile.phone.as_deref() else {
            return DeliveryOutcome::from_channel_error(ChannelError::MissingContactField {
                subject_id: request.subject_id,
                field: "phone number".to_string(),
            });
        };

        match transport.send(to, &request.content.body).await {
            Ok(receipt) => DeliveryOutcome::Delivered {
                provider_message_id: receipt.provider_message_id,
            },
            Err(e) => DeliveryOutcome::from_channel_error(e),
        }
    }

    async fn deliver_stage_change(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let Some(stage_id) = request.target_stage else {
            // Half-configured rules are filtered at evaluation time; reaching
            // here without a target stage is a persisted-item inconsistency.
            return DeliveryOutcome::Failed {
                error: "stage change without target stage".to_string(),
            };
        };

        match self
            .pipeline
            .update_subject_stage(request.tenant_id, request.subject_id, stage_id)
            .await
        {
            Ok(()) => DeliveryOutcome::Delivered {
                provider_message_id: None,
            },
            Err(e) => DeliveryOutcome::Retryable {
                error: e.to_string(),
            },
        }
    }

    async fn deliver_smart_file(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let Some(sender) = &self.smart_files else {
            return DeliveryOutcome::from_channel_error(ChannelError::NotConfigured {
                channel: "smart_file".to_string(),
            });
        };

        match sender
            .send(request.tenant_id, request.subject_id, &request.content.body)
            .await
        {
            Ok(receipt) => DeliveryOutcome::Delivered {
                provider_message_id: receipt.provider_message_id,
            },
            Err(e) => DeliveryOutcome::from_channel_error(e),
        }
    }

    async fn load_profile(
        &self,
        request: &DeliveryRequest,
    ) -> Result<SubjectProfile, DeliveryOutcome> {
        match self
            .directory
            .profile(request.tenant_id, request.subject_id)
            .await
        {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(DeliveryOutcome::Failed {
                error: format!("subject {} not found in directory", request.subject_id),
            }),
            Err(e) => Err(DeliveryOutcome::Retryable {
                error: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_display_parse() {
        for kind in [
            ChannelKind::Email,
            ChannelKind::Sms,
            ChannelKind::StateChange,
            ChannelKind::SmartFile,
        ] {
            let s = kind.to_string();
            let parsed: ChannelKind = s.parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_channel_rejected() {
        assert!("carrier_pigeon".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn permanent_errors_map_to_failed() {
        let outcome = DeliveryOutcome::from_channel_error(ChannelError::NotConfigured {
            channel: "sms".to_string(),
        });
        assert!(matches!(outcome, DeliveryOutcome::Failed { .. }));

        let outcome = DeliveryOutcome::from_channel_error(ChannelError::RateLimited {
            channel: "email".to_string(),
        });
        assert!(matches!(outcome, DeliveryOutcome::Retryable { .. }));
    }
}
