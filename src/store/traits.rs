//! Backend-agnostic `Store` trait — single async interface for all
//! persistence. No core logic may assume a specific storage engine; the
//! libSQL backend is one implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::automation::model::{
    Automation, AutomationStep, BusinessEventType, BusinessTrigger,
};
use crate::campaign::model::{CampaignStatus, DripCampaign, DripCampaignEmail, EmailApproval};
use crate::campaign::subscription::{Subscription, SubscriptionStatus};
use crate::dispatch::model::{DueItem, ExecutionRecord, RuleRef};
use crate::error::DatabaseError;

/// A reusable content template owned by one tenant.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub subject: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A contact/project row.
///
/// The CRM is a monolith: subjects live in the same database, and the
/// default pipeline/calendar/directory collaborators read this table. The
/// engine core still only touches subjects through those traits.
#[derive(Debug, Clone)]
pub struct SubjectRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage_id: Option<Uuid>,
    pub project_type: Option<String>,
    pub wedding_date: Option<NaiveDate>,
    pub session_date: Option<NaiveDate>,
    /// Extra merge fields.
    pub fields: HashMap<String, String>,
}

/// Durable CRUD for every engine entity plus the execution log.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(&self, automation: &Automation) -> Result<(), DatabaseError>;

    async fn update_automation(&self, automation: &Automation) -> Result<(), DatabaseError>;

    async fn get_automation(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Automation>, DatabaseError>;

    /// All automations for one tenant, enabled or not. Rows with malformed
    /// kind config are skipped with a warning, never returned as errors.
    async fn list_automations(&self, tenant_id: Uuid) -> Result<Vec<Automation>, DatabaseError>;

    /// Enabled automations for one tenant.
    async fn list_enabled_automations(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<Automation>, DatabaseError>;

    /// Enabled countdown automations across all tenants (the clock tick
    /// scans every tenant).
    async fn list_enabled_countdowns(&self) -> Result<Vec<Automation>, DatabaseError>;

    async fn set_automation_enabled(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<(), DatabaseError>;

    async fn create_automation_step(&self, step: &AutomationStep) -> Result<(), DatabaseError>;

    /// Steps of one automation, ordered by step index.
    async fn list_automation_steps(
        &self,
        automation_id: Uuid,
    ) -> Result<Vec<AutomationStep>, DatabaseError>;

    /// Fails with `Constraint` if the automation already has a trigger of
    /// this event type.
    async fn create_business_trigger(
        &self,
        trigger: &BusinessTrigger,
    ) -> Result<(), DatabaseError>;

    async fn list_business_triggers(
        &self,
        tenant_id: Uuid,
        event_type: BusinessEventType,
    ) -> Result<Vec<BusinessTrigger>, DatabaseError>;

    /// Ids of automations bound to any business trigger. These are
    /// event-driven and never match stage entries.
    async fn list_triggered_automation_ids(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Drip campaigns ──────────────────────────────────────────────

    async fn create_campaign(&self, campaign: &DripCampaign) -> Result<(), DatabaseError>;

    async fn get_campaign(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<DripCampaign>, DatabaseError>;

    async fn list_campaigns(&self, tenant_id: Uuid) -> Result<Vec<DripCampaign>, DatabaseError>;

    async fn set_campaign_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    async fn list_active_campaigns_for_stage(
        &self,
        tenant_id: Uuid,
        stage_id: Uuid,
    ) -> Result<Vec<DripCampaign>, DatabaseError>;

    async fn create_campaign_email(
        &self,
        email: &DripCampaignEmail,
    ) -> Result<(), DatabaseError>;

    /// Emails of one campaign, ordered by email index.
    async fn list_campaign_emails(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<DripCampaignEmail>, DatabaseError>;

    async fn set_email_approval(
        &self,
        campaign_id: Uuid,
        email_index: u32,
        approval: EmailApproval,
    ) -> Result<(), DatabaseError>;

    // ── Subscription ledger ─────────────────────────────────────────

    /// Returns `false` when a subscription for (campaign, project) already
    /// exists — enrollment is idempotent.
    async fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, DatabaseError>;

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Subscription>, DatabaseError>;

    /// Active subscriptions with `next_email_at <= now`, across all tenants.
    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, DatabaseError>;

    /// Advance (or complete) a subscription cursor.
    async fn advance_subscription(
        &self,
        id: Uuid,
        next_email_index: u32,
        next_email_at: Option<DateTime<Utc>>,
        status: SubscriptionStatus,
    ) -> Result<(), DatabaseError>;

    async fn set_subscription_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), DatabaseError>;

    // ── Due-items ───────────────────────────────────────────────────

    /// Insert if no pending item exists for (automation, subject,
    /// occurrence); returns whether a row was created.
    async fn upsert_due_item(&self, item: &DueItem) -> Result<bool, DatabaseError>;

    /// Items with `fire_at <= now`, across all tenants.
    async fn list_due_items(&self, now: DateTime<Utc>) -> Result<Vec<DueItem>, DatabaseError>;

    async fn delete_due_item(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Execution log ───────────────────────────────────────────────

    /// Append an execution record. For successful records this is the
    /// idempotency claim: an atomic conditional insert that returns `false`
    /// when another writer already recorded success for the same
    /// (rule, subject, occurrence). Failure and skip records always insert.
    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<bool, DatabaseError>;

    async fn has_successful_execution(
        &self,
        rule: &RuleRef,
        subject_id: Uuid,
        occurrence_key: &str,
    ) -> Result<bool, DatabaseError>;

    /// Most recent executions for one subject, newest first.
    async fn list_subject_history(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    async fn create_template(&self, template: &MessageTemplate) -> Result<(), DatabaseError>;

    async fn get_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<MessageTemplate>, DatabaseError>;

    // ── Tenant settings ─────────────────────────────────────────────

    /// The tenant's configured send hour, if set.
    async fn send_hour(&self, tenant_id: Uuid) -> Result<Option<u32>, DatabaseError>;

    async fn set_send_hour(&self, tenant_id: Uuid, hour: u32) -> Result<(), DatabaseError>;

    // ── Subjects ────────────────────────────────────────────────────

    async fn upsert_subject(&self, subject: &SubjectRecord) -> Result<(), DatabaseError>;

    async fn get_subject(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SubjectRecord>, DatabaseError>;

    /// Subjects whose anchor date falls in `[from, to]` inclusive, with the
    /// date. Backs the default calendar collaborator.
    async fn list_subjects_with_event_between(
        &self,
        tenant_id: Uuid,
        anchor: crate::automation::model::AnchorEvent,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(Uuid, NaiveDate)>, DatabaseError>;
}
