//! The subscription ledger — per-project cursor state for drip campaigns.
//!
//! One row per (campaign, project). The cursor (`next_email_index`,
//! `next_email_at`) is advanced by the dispatcher only after a recorded
//! successful send of that exact index; pausing and resuming leave the
//! cursor untouched.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Completed,
    Unsubscribed,
}

impl SubscriptionStatus {
    /// ACTIVE ↔ PAUSED, ACTIVE → COMPLETED, and any state → UNSUBSCRIBED.
    /// COMPLETED and UNSUBSCRIBED take no other transitions.
    pub fn can_transition_to(&self, target: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if self == &target {
            return false;
        }
        match (self, target) {
            (_, Unsubscribed) => true,
            (Active, Paused) | (Paused, Active) | (Active, Completed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Completed | SubscriptionStatus::Unsubscribed
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Paused => write!(f, "paused"),
            SubscriptionStatus::Completed => write!(f, "completed"),
            SubscriptionStatus::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "paused" => Ok(SubscriptionStatus::Paused),
            "completed" => Ok(SubscriptionStatus::Completed),
            "unsubscribed" => Ok(SubscriptionStatus::Unsubscribed),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// Cursor row tracking one project's progress through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    /// The project being nurtured.
    pub project_id: Uuid,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub next_email_index: u32,
    /// When the next email is due. `None` once the sequence is exhausted.
    pub next_email_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// New active subscription starting now, cursor at index 0.
    pub fn new(
        tenant_id: Uuid,
        campaign_id: Uuid,
        project_id: Uuid,
        started_at: DateTime<Utc>,
        first_email_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id,
            project_id,
            status: if first_email_at.is_some() {
                SubscriptionStatus::Active
            } else {
                // Enrolling into a campaign with no sendable sequence.
                SubscriptionStatus::Completed
            },
            started_at,
            next_email_index: 0,
            next_email_at: first_email_at,
            created_at: now,
            updated_at: now,
        }
    }
}
