//! External collaborator traits.
//!
//! The engine treats the rest of the CRM as narrow seams: the pipeline/stage
//! service, the calendar that knows subjects' event dates, the contact
//! directory, and the outbound transports. The binary wires these to the
//! shared database (the CRM is a monolith); tests wire them to mocks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::automation::model::AnchorEvent;
use crate::error::{ChannelError, CollabError};

/// Contact/project profile used for targeting and merge-field rendering.
#[derive(Debug, Clone, Default)]
pub struct SubjectProfile {
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Additional merge fields (studio name, package name, ...).
    pub fields: HashMap<String, String>,
}

impl SubjectProfile {
    /// Look up a merge field by name. Built-in fields shadow custom ones.
    pub fn merge_field(&self, name: &str) -> Option<&str> {
        match name {
            "first_name" => self.first_name.as_deref(),
            "email" => self.email.as_deref(),
            "phone" => self.phone.as_deref(),
            _ => self.fields.get(name).map(String::as_str),
        }
    }
}

/// Pipeline/stage collaborator. Stage identifiers are opaque to the engine.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// The subject's current stage, if it is in the pipeline.
    async fn subject_stage(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<Uuid>, CollabError>;

    /// Move the subject to a new stage.
    async fn update_subject_stage(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        stage_id: Uuid,
    ) -> Result<(), CollabError>;
}

/// Calendar collaborator supplying anchor dates for countdown automations.
/// The engine only reads these values.
#[async_trait]
pub trait EventCalendar: Send + Sync {
    /// The subject's date for the given anchor event, if booked.
    async fn anchor_date(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        anchor: AnchorEvent,
    ) -> Result<Option<NaiveDate>, CollabError>;

    /// All subjects of a tenant whose anchor date falls in `[from, to]`
    /// inclusive, with the date.
    async fn subjects_with_event_between(
        &self,
        tenant_id: Uuid,
        anchor: AnchorEvent,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(Uuid, NaiveDate)>, CollabError>;
}

/// Contact directory collaborator.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn profile(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<SubjectProfile>, CollabError>;
}

/// Transport-level acknowledgment from a delivery collaborator.
#[derive(Debug, Clone, Default)]
pub struct TransportReceipt {
    pub provider_message_id: Option<String>,
}

/// Outbound email transport. The engine never retries at this level; retry
/// is purely the next-scheduler-pass mechanism.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<TransportReceipt, ChannelError>;
}

/// Outbound SMS transport.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<TransportReceipt, ChannelError>;
}

/// Smart file collaborator — sends the subject a proposal/contract link.
/// Link generation and the e-sign workflow live outside the engine.
#[async_trait]
pub trait SmartFileSender: Send + Sync {
    async fn send(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        message: &str,
    ) -> Result<TransportReceipt, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_field_builtins_and_custom() {
        let mut fields = HashMap::new();
        fields.insert("studio_name".to_string(), "Golden Hour Co".to_string());
        let profile = SubjectProfile {
            first_name: Some("Maya".to_string()),
            email: Some("maya@example.com".to_string()),
            phone: None,
            fields,
        };

        assert_eq!(profile.merge_field("first_name"), Some("Maya"));
        assert_eq!(profile.merge_field("studio_name"), Some("Golden Hour Co"));
        assert_eq!(profile.merge_field("phone"), None);
        assert_eq!(profile.merge_field("nope"), None);
    }
}
