//! Core types for drip campaigns.
//!
//! A campaign targets one pipeline stage and one project type and owns an
//! ordered email sequence. Campaign status and per-email approval are
//! independent: an ACTIVE campaign may still hold unapproved emails, and
//! only approved emails are eligible to send.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Campaign lifecycle. ACTIVE is the terminal operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Approved,
    Active,
    Deleted,
}

impl CampaignStatus {
    /// Allowed transitions: DRAFT → APPROVED → ACTIVE, or any live state →
    /// DELETED.
    pub fn can_transition_to(&self, target: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, target),
            (Draft, Approved) | (Approved, Active) | (Draft, Deleted) | (Approved, Deleted)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Approved => write!(f, "approved"),
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "approved" => Ok(CampaignStatus::Approved),
            "active" => Ok(CampaignStatus::Active),
            "deleted" => Ok(CampaignStatus::Deleted),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Per-email approval. Only approved emails are eligible to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailApproval {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for EmailApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailApproval::Pending => write!(f, "pending"),
            EmailApproval::Approved => write!(f, "approved"),
            EmailApproval::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for EmailApproval {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmailApproval::Pending),
            "approved" => Ok(EmailApproval::Approved),
            "rejected" => Ok(EmailApproval::Rejected),
            other => Err(format!("unknown email approval: {other}")),
        }
    }
}

/// Offset of one email from subscription start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum StepOffset {
    Days(i64),
    Weeks(i64),
}

impl StepOffset {
    pub fn as_duration(&self) -> Duration {
        match self {
            StepOffset::Days(d) => Duration::days(*d),
            StepOffset::Weeks(w) => Duration::weeks(*w),
        }
    }
}

/// A multi-email nurture sequence targeting one stage and project type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripCampaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub target_stage: Uuid,
    pub project_type: String,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One email in a campaign's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripCampaignEmail {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub email_index: u32,
    pub subject: String,
    pub body: String,
    pub offset: StepOffset,
    pub approval: EmailApproval,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Active));
        assert!(Draft.can_transition_to(Deleted));
        assert!(Approved.can_transition_to(Deleted));

        // Active is the terminal operating state.
        assert!(!Active.can_transition_to(Deleted));
        assert!(!Active.can_transition_to(Draft));
        // No skipping approval.
        assert!(!Draft.can_transition_to(Active));
        // Deleted is terminal.
        assert!(!Deleted.can_transition_to(Draft));
    }

    #[test]
    fn status_display_parse() {
        for status in [
            CampaignStatus::Draft,
            CampaignStatus::Approved,
            CampaignStatus::Active,
            CampaignStatus::Deleted,
        ] {
            let parsed: CampaignStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn approval_display_parse() {
        for approval in [
            EmailApproval::Pending,
            EmailApproval::Approved,
            EmailApproval::Rejected,
        ] {
            let parsed: EmailApproval = approval.to_string().parse().unwrap();
            assert_eq!(parsed, approval);
        }
    }

    #[test]
    fn offset_durations() {
        assert_eq!(StepOffset::Days(9).as_duration(), Duration::days(9));
        assert_eq!(StepOffset::Weeks(2).as_duration(), Duration::days(14));
    }
}
