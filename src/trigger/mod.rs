//! Trigger events and the evaluator that matches them against rules.

pub mod evaluator;

pub use evaluator::TriggerEvaluator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::model::BusinessEventType;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// A contact/project entered a pipeline stage.
    StageEntered {
        stage_id: Uuid,
        #[serde(default)]
        project_type: Option<String>,
    },
    /// A non-stage business event occurred.
    BusinessEvent { event_type: BusinessEventType },
    /// The periodic scheduler tick. Countdown automations and due drip
    /// subscriptions are matched against the clock, not an external event.
    ClockTick,
}

/// An event entering the engine. Stage changes and business events are
/// fire-and-forget with respect to automation side effects: nothing is
/// reported back to whoever produced the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub tenant_id: Uuid,
    /// The contact or project the event is about.
    pub subject_id: Uuid,
    /// Also part of the occurrence key: replaying an event with the same
    /// timestamp is idempotent, while a genuine re-occurrence carries a new
    /// one.
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    pub kind: TriggerKind,
}

impl TriggerEvent {
    pub fn stage_entered(
        tenant_id: Uuid,
        subject_id: Uuid,
        stage_id: Uuid,
        project_type: Option<String>,
    ) -> Self {
        Self {
            tenant_id,
            subject_id,
            occurred_at: Utc::now(),
            kind: TriggerKind::StageEntered {
                stage_id,
                project_type,
            },
        }
    }

    pub fn business_event(
        tenant_id: Uuid,
        subject_id: Uuid,
        event_type: BusinessEventType,
    ) -> Self {
        Self {
            tenant_id,
            subject_id,
            occurred_at: Utc::now(),
            kind: TriggerKind::BusinessEvent { event_type },
        }
    }
}
