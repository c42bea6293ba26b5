//! Core types for the automation system.
//!
//! An automation is a tenant-owned rule mapping a trigger to an action.
//! Kind-specific parameters live in a JSON config column keyed by a string
//! tag; `from_db` is also where the configuration invariants are enforced,
//! so a half-configured row surfaces as a `RuleError` the evaluator can
//! skip without aborting the batch.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::error::RuleError;

/// Which pipeline stages an automation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// A specific pipeline stage.
    Stage(Uuid),
    /// Entry to any stage of a matching project type.
    Global,
}

impl Scope {
    pub fn stage_id(&self) -> Option<Uuid> {
        match self {
            Scope::Stage(id) => Some(*id),
            Scope::Global => None,
        }
    }
}

/// Pinned clock time for a delayed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

impl ClockTime {
    pub fn validate(&self, automation_id: Uuid) -> Result<(), RuleError> {
        if self.hour > 23 || self.minute > 59 {
            return Err(RuleError::InvalidField {
                id: automation_id,
                field: "send_at".to_string(),
                message: format!("{:02}:{:02} is not a clock time", self.hour, self.minute),
            });
        }
        Ok(())
    }
}

/// Delay from trigger time to fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DelaySpec {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    /// Pin the resolved date to this clock time, pushing forward to the next
    /// occurrence if the pin would move the fire time backward.
    #[serde(default)]
    pub send_at: Option<ClockTime>,
}

impl DelaySpec {
    /// Zero-delay automations fire within the same evaluation pass.
    pub fn is_immediate(&self) -> bool {
        self.days == 0 && self.hours == 0 && self.minutes == 0 && self.send_at.is_none()
    }

    pub fn validate(&self, automation_id: Uuid) -> Result<(), RuleError> {
        if self.days < 0 || self.hours < 0 || self.minutes < 0 {
            return Err(RuleError::InvalidField {
                id: automation_id,
                field: "delay".to_string(),
                message: "delay components must be non-negative".to_string(),
            });
        }
        if let Some(clock) = &self.send_at {
            clock.validate(automation_id)?;
        }
        Ok(())
    }
}

/// What an automation sends: inline text or a reusable template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Inline {
        #[serde(default)]
        subject: Option<String>,
        body: String,
    },
    Template {
        template_id: Uuid,
    },
}

/// The event-date field a countdown automation measures backward from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorEvent {
    WeddingDate,
    SessionDate,
}

impl std::fmt::Display for AnchorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorEvent::WeddingDate => write!(f, "wedding_date"),
            AnchorEvent::SessionDate => write!(f, "session_date"),
        }
    }
}

impl FromStr for AnchorEvent {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wedding_date" => Ok(AnchorEvent::WeddingDate),
            "session_date" => Ok(AnchorEvent::SessionDate),
            other => Err(format!("unknown anchor event: {other}")),
        }
    }
}

/// Kind-specific automation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationKind {
    /// Send content after a delay (possibly zero) from the trigger.
    Communication { content: Content, delay: DelaySpec },
    /// Move the subject to a new stage immediately. No delay concept.
    StageChange { target_stage: Uuid },
    /// Send content `days_before` days ahead of the subject's anchor date,
    /// at the tenant's configured send hour.
    Countdown {
        anchor: AnchorEvent,
        days_before: i64,
        content: Content,
    },
}

impl AutomationKind {
    /// The string tag stored in the DB kind_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            AutomationKind::Communication { .. } => "communication",
            AutomationKind::StageChange { .. } => "stage_change",
            AutomationKind::Countdown { .. } => "countdown",
        }
    }

    /// Parse kind parameters from their DB representation, enforcing the
    /// per-kind invariants.
    pub fn from_db(
        automation_id: Uuid,
        kind_type: &str,
        config: serde_json::Value,
    ) -> Result<Self, RuleError> {
        match kind_type {
            "communication" => {
                let content = parse_content(automation_id, &config)?;
                let delay: DelaySpec = config
                    .get("delay")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| RuleError::InvalidField {
                        id: automation_id,
                        field: "delay".to_string(),
                        message: e.to_string(),
                    })?
                    .unwrap_or_default();
                delay.validate(automation_id)?;
                Ok(AutomationKind::Communication { content, delay })
            }
            "stage_change" => {
                let target_stage = config
                    .get("target_stage")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuleError::MissingField {
                        id: automation_id,
                        field: "target_stage".to_string(),
                    })?;
                let target_stage =
                    Uuid::parse_str(target_stage).map_err(|e| RuleError::InvalidField {
                        id: automation_id,
                        field: "target_stage".to_string(),
                        message: e.to_string(),
                    })?;
                Ok(AutomationKind::StageChange { target_stage })
            }
            "countdown" => {
                let anchor = config
                    .get("anchor")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RuleError::MissingField {
                        id: automation_id,
                        field: "anchor".to_string(),
                    })?
                    .parse()
                    .map_err(|e: String| RuleError::InvalidField {
                        id: automation_id,
                        field: "anchor".to_string(),
                        message: e,
                    })?;
                let days_before = config
                    .get("days_before")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| RuleError::MissingField {
                        id: automation_id,
                        field: "days_before".to_string(),
                    })?;
                let content = parse_content(automation_id, &config)?;
                Ok(AutomationKind::Countdown {
                    anchor,
                    days_before,
                    content,
                })
            }
            other => Err(RuleError::UnknownTag {
                what: "automation kind".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Serialize kind parameters to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            AutomationKind::Communication { content, delay } => serde_json::json!({
                "content": content,
                "delay": delay,
            }),
            AutomationKind::StageChange { target_stage } => serde_json::json!({
                "target_stage": target_stage.to_string(),
            }),
            AutomationKind::Countdown {
                anchor,
                days_before,
                content,
            } => serde_json::json!({
                "anchor": anchor.to_string(),
                "days_before": days_before,
                "content": content,
            }),
        }
    }
}

fn parse_content(automation_id: Uuid, config: &serde_json::Value) -> Result<Content, RuleError> {
    let value = config.get("content").ok_or_else(|| RuleError::MissingField {
        id: automation_id,
        field: "content".to_string(),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| RuleError::InvalidField {
        id: automation_id,
        field: "content".to_string(),
        message: e.to_string(),
    })
}

/// A tenant-owned rule mapping a trigger to an action.
///
/// Never hard-deleted while referenced by audit rows; disable instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub scope: Scope,
    /// Restrict to projects of this type; `None` means all.
    pub project_type: Option<String>,
    pub channel: ChannelKind,
    pub enabled: bool,
    pub kind: AutomationKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    /// True when this automation applies to projects of `project_type`.
    pub fn matches_project_type(&self, project_type: Option<&str>) -> bool {
        match (&self.project_type, project_type) {
            (None, _) => true,
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
        }
    }
}

/// One step of a multi-action communication automation.
///
/// Each step's delay is measured from the trigger time, not from the
/// previous step's send, which is what keeps steps in index order without
/// cross-step coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStep {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub step_index: u32,
    pub channel: ChannelKind,
    pub content: Content,
    pub delay: DelaySpec,
}

impl AutomationStep {
    /// Steps perform communications; stage mutation is not a step action.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.channel == ChannelKind::StateChange {
            return Err(RuleError::InvalidField {
                id: self.automation_id,
                field: format!("steps[{}].channel", self.step_index),
                message: "steps cannot change stage".to_string(),
            });
        }
        self.delay.validate(self.automation_id)
    }
}

/// A non-stage business event that can fire automations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessEventType {
    AppointmentBooked,
    GalleryShared,
    ProposalSigned,
    QuestionnaireCompleted,
    InvoicePaid,
}

impl std::fmt::Display for BusinessEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BusinessEventType::AppointmentBooked => "appointment_booked",
            BusinessEventType::GalleryShared => "gallery_shared",
            BusinessEventType::ProposalSigned => "proposal_signed",
            BusinessEventType::QuestionnaireCompleted => "questionnaire_completed",
            BusinessEventType::InvoicePaid => "invoice_paid",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BusinessEventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appointment_booked" => Ok(BusinessEventType::AppointmentBooked),
            "gallery_shared" => Ok(BusinessEventType::GalleryShared),
            "proposal_signed" => Ok(BusinessEventType::ProposalSigned),
            "questionnaire_completed" => Ok(BusinessEventType::QuestionnaireCompleted),
            "invoice_paid" => Ok(BusinessEventType::InvoicePaid),
            other => Err(format!("unknown business event: {other}")),
        }
    }
}

/// Binds an automation to a business event.
///
/// Uniqueness invariant: one trigger-type per automation (enforced by the
/// store). `source_stage` restricts firing to subjects currently in that
/// stage; `None` means any current stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessTrigger {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub event_type: BusinessEventType,
    pub source_stage: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn communication_roundtrip() {
        let kind = AutomationKind::Communication {
            content: Content::Inline {
                subject: Some("Welcome!".to_string()),
                body: "Hi {{first_name}}, thanks for reaching out.".to_string(),
            },
            delay: DelaySpec {
                days: 1,
                hours: 2,
                minutes: 30,
                send_at: None,
            },
        };
        let json = kind.to_config_json();
        let parsed = AutomationKind::from_db(Uuid::new_v4(), "communication", json).unwrap();
        assert_eq!(parsed, kind);
    }

    #[test]
    fn stage_change_roundtrip() {
        let stage = Uuid::new_v4();
        let kind = AutomationKind::StageChange {
            target_stage: stage,
        };
        let json = kind.to_config_json();
        let parsed = AutomationKind::from_db(Uuid::new_v4(), "stage_change", json).unwrap();
        assert_eq!(parsed, kind);
    }

    #[test]
    fn countdown_roundtrip() {
        let kind = AutomationKind::Countdown {
            anchor: AnchorEvent::WeddingDate,
            days_before: 7,
            content: Content::Template {
                template_id: Uuid::new_v4(),
            },
        };
        let json = kind.to_config_json();
        let parsed = AutomationKind::from_db(Uuid::new_v4(), "countdown", json).unwrap();
        assert_eq!(parsed, kind);
    }

    #[test]
    fn stage_change_missing_target_is_rule_error() {
        let result =
            AutomationKind::from_db(Uuid::new_v4(), "stage_change", serde_json::json!({}));
        assert!(matches!(result, Err(RuleError::MissingField { field, .. }) if field == "target_stage"));
    }

    #[test]
    fn communication_missing_content_is_rule_error() {
        let result = AutomationKind::from_db(
            Uuid::new_v4(),
            "communication",
            serde_json::json!({ "delay": { "days": 1 } }),
        );
        assert!(matches!(result, Err(RuleError::MissingField { field, .. }) if field == "content"));
    }

    #[test]
    fn negative_delay_rejected() {
        let result = AutomationKind::from_db(
            Uuid::new_v4(),
            "communication",
            serde_json::json!({
                "content": { "type": "inline", "body": "hi" },
                "delay": { "days": -1 },
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_kind_rejected() {
        let result = AutomationKind::from_db(Uuid::new_v4(), "webhook", serde_json::json!({}));
        assert!(matches!(result, Err(RuleError::UnknownTag { .. })));
    }

    #[test]
    fn zero_delay_is_immediate() {
        assert!(DelaySpec::default().is_immediate());
        assert!(
            !DelaySpec {
                minutes: 5,
                ..Default::default()
            }
            .is_immediate()
        );
        assert!(
            !DelaySpec {
                send_at: Some(ClockTime { hour: 9, minute: 0 }),
                ..Default::default()
            }
            .is_immediate()
        );
    }

    #[test]
    fn invalid_clock_time_rejected() {
        let clock = ClockTime {
            hour: 24,
            minute: 0,
        };
        assert!(clock.validate(Uuid::new_v4()).is_err());
    }

    #[test]
    fn project_type_matching() {
        let automation = Automation {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "welcome".to_string(),
            scope: Scope::Global,
            project_type: Some("wedding".to_string()),
            channel: ChannelKind::Email,
            enabled: true,
            kind: AutomationKind::Communication {
                content: Content::Inline {
                    subject: None,
                    body: "hi".to_string(),
                },
                delay: DelaySpec::default(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(automation.matches_project_type(Some("wedding")));
        assert!(!automation.matches_project_type(Some("portrait")));
        assert!(!automation.matches_project_type(None));
    }

    #[test]
    fn step_cannot_change_stage() {
        let step = AutomationStep {
            id: Uuid::new_v4(),
            automation_id: Uuid::new_v4(),
            step_index: 0,
            channel: ChannelKind::StateChange,
            content: Content::Inline {
                subject: None,
                body: String::new(),
            },
            delay: DelaySpec::default(),
        };
        assert!(step.validate().is_err());
    }

    #[test]
    fn business_event_display_parse() {
        for event in [
            BusinessEventType::AppointmentBooked,
            BusinessEventType::GalleryShared,
            BusinessEventType::ProposalSigned,
            BusinessEventType::QuestionnaireCompleted,
            BusinessEventType::InvoicePaid,
        ] {
            let parsed: BusinessEventType = event.to_string().parse().unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn anchor_event_display_parse() {
        for anchor in [AnchorEvent::WeddingDate, AnchorEvent::SessionDate] {
            let parsed: AnchorEvent = anchor.to_string().parse().unwrap();
            assert_eq!(parsed, anchor);
        }
    }
}
