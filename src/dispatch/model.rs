//! Due-items and the append-only execution log.
//!
//! The execution log serves double duty: user-visible history and the
//! idempotency guard. A partial unique index over successful rows keyed by
//! (rule, subject, occurrence) makes the success insert an atomic
//! conditional claim — the periodic scan is not guaranteed single-instance,
//! so this is load-bearing, not defensive bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::model::Content;
use crate::channels::ChannelKind;
use crate::trigger::{TriggerEvent, TriggerKind};

/// A persisted "fire this at or after this timestamp" record.
///
/// Upsert-unique on (automation, subject, occurrence_key): repeated
/// evaluation passes never duplicate pending work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DueItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub automation_id: Uuid,
    /// Step index for multi-step communication automations.
    pub step_index: Option<u32>,
    pub subject_id: Uuid,
    pub channel: ChannelKind,
    /// Content frozen at evaluation time; templates re-resolve at dispatch.
    pub content: Content,
    pub occurrence_key: String,
    pub fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Which rule an execution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RuleRef {
    Automation(Uuid),
    Campaign(Uuid),
}

impl RuleRef {
    /// The string tag stored in the DB rule_kind column.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            RuleRef::Automation(_) => "automation",
            RuleRef::Campaign(_) => "campaign",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            RuleRef::Automation(id) | RuleRef::Campaign(id) => *id,
        }
    }
}

/// Outcome of one fired action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Sent,
    Failed,
    /// The step was consumed without a send (e.g. a rejected drip email).
    Skipped,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Sent => write!(f, "sent"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(ExecutionStatus::Sent),
            "failed" => Ok(ExecutionStatus::Failed),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Append-only log entry for one fired action. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule: RuleRef,
    pub subject_id: Uuid,
    pub occurrence_key: String,
    pub channel: ChannelKind,
    pub status: ExecutionStatus,
    /// Error text for failures, note for skips.
    pub detail: Option<String>,
    pub provider_message_id: Option<String>,
    /// Operational anomaly marker, e.g. "disabled-after-fire".
    pub anomaly: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        tenant_id: Uuid,
        rule: RuleRef,
        subject_id: Uuid,
        occurrence_key: String,
        channel: ChannelKind,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            rule,
            subject_id,
            occurrence_key,
            channel,
            status,
            detail: None,
            provider_message_id: None,
            anomaly: None,
            executed_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_provider_message_id(mut self, id: Option<String>) -> Self {
        self.provider_message_id = id;
        self
    }

    pub fn with_anomaly(mut self, anomaly: impl Into<String>) -> Self {
        self.anomaly = Some(anomaly.into());
        self
    }
}

// ── Occurrence keys ─────────────────────────────────────────────────
//
// The occurrence key distinguishes separate firings of the same rule for
// the same subject. Re-entering a stage months later is a new occurrence;
// replaying the same event (or racing scheduler instances) is not.

/// Key for an automation fired by a stage entry or business event.
pub fn event_occurrence_key(event: &TriggerEvent, step_index: Option<u32>) -> String {
    let tag = match &event.kind {
        TriggerKind::StageEntered { stage_id, .. } => format!("stage:{stage_id}"),
        TriggerKind::BusinessEvent { event_type } => format!("biz:{event_type}"),
        TriggerKind::ClockTick => "tick".to_string(),
    };
    match step_index {
        Some(index) => format!("{tag}:{}:step{index}", event.occurred_at.timestamp()),
        None => format!("{tag}:{}", event.occurred_at.timestamp()),
    }
}

/// Key for a countdown firing: one per (rule, subject, anchor date). A
/// rescheduled event date is a new occurrence.
pub fn countdown_occurrence_key(anchor_date: NaiveDate) -> String {
    format!("countdown:{anchor_date}")
}

/// Key for one email of a drip subscription.
pub fn email_occurrence_key(email_index: u32) -> String {
    format!("email:{email_index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::model::BusinessEventType;
    use chrono::TimeZone;

    #[test]
    fn rule_ref_tags() {
        let id = Uuid::new_v4();
        assert_eq!(RuleRef::Automation(id).kind_tag(), "automation");
        assert_eq!(RuleRef::Campaign(id).kind_tag(), "campaign");
        assert_eq!(RuleRef::Automation(id).id(), id);
    }

    #[test]
    fn event_keys_are_stable_across_replays() {
        let event = TriggerEvent {
            tenant_id: Uuid::new_v4(),
            subject_id: Uuid::new_v4(),
            occurred_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            kind: TriggerKind::BusinessEvent {
                event_type: BusinessEventType::AppointmentBooked,
            },
        };
        assert_eq!(
            event_occurrence_key(&event, None),
            event_occurrence_key(&event, None)
        );
        assert_ne!(
            event_occurrence_key(&event, Some(0)),
            event_occurrence_key(&event, Some(1))
        );
    }

    #[test]
    fn countdown_key_changes_with_anchor_date() {
        let d1 = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        assert_ne!(countdown_occurrence_key(d1), countdown_occurrence_key(d2));
    }

    #[test]
    fn execution_status_display_parse() {
        for status in [
            ExecutionStatus::Sent,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
