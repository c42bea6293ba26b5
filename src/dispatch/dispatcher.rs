//! The scheduler pass — scan for due work, execute it exactly once.
//!
//! Each pass is a pure function over (current time, persisted state): all
//! mutation is an explicit store write, no state is held between passes,
//! and multiple instances may run the pass concurrently. Correctness under
//! that concurrency rests on the conditional success-insert in the
//! execution log, not on mutual exclusion.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::automation::model::{AutomationKind, Content};
use crate::campaign::model::{CampaignStatus, DripCampaignEmail, EmailApproval};
use crate::campaign::subscription::{Subscription, SubscriptionStatus};
use crate::channels::{ChannelKind, DeliveryOutcome, DeliveryRequest, DeliveryRouter, ResolvedContent};
use crate::collab::{EventCalendar, SubjectDirectory, SubjectProfile};
use crate::config::EngineConfig;
use crate::content::ContentResolver;
use crate::dispatch::model::{
    countdown_occurrence_key, email_occurrence_key, DueItem, ExecutionRecord, ExecutionStatus,
    RuleRef,
};
use crate::store::Store;
use crate::timing;

/// One action ready to execute.
pub struct AutomationAction {
    pub tenant_id: Uuid,
    pub automation_id: Uuid,
    pub subject_id: Uuid,
    pub channel: ChannelKind,
    pub content: Content,
    /// Target stage for stage-change actions.
    pub target_stage: Option<Uuid>,
    pub occurrence_key: String,
    /// Audit anomaly marker, e.g. "disabled-after-fire".
    pub anomaly: Option<String>,
}

/// What happened to one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    /// A success record already existed (replay or lost race) — not an error.
    AlreadyDone,
    Failed,
    /// Configuration problem (e.g. missing template): logged, item left
    /// due, never surfaced as a send failure.
    ConfigSkipped,
}

/// Counters for one pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub sent: usize,
    pub failed: usize,
    pub already_done: usize,
    /// Subscriptions holding on an unapproved email or inactive campaign.
    pub held: usize,
    /// Rejected drip emails consumed without a send.
    pub skipped: usize,
}

/// Executes due work against the delivery router and the execution log.
pub struct Dispatcher {
    config: EngineConfig,
    store: Arc<dyn Store>,
    router: Arc<DeliveryRouter>,
    content: ContentResolver,
    calendar: Arc<dyn EventCalendar>,
    directory: Arc<dyn SubjectDirectory>,
}

impl Dispatcher {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        router: Arc<DeliveryRouter>,
        calendar: Arc<dyn EventCalendar>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Self {
        let content = ContentResolver::new(store.clone());
        Self {
            config,
            store,
            router,
            content,
            calendar,
            directory,
        }
    }

    /// One scheduler pass over everything due at `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassSummary {
        let mut summary = PassSummary::default();

        // Countdown scan first so items that are already past their send
        // hour are picked up by the due-item scan in the same pass.
        self.scan_countdowns(now).await;
        self.dispatch_due_items(now, &mut summary).await;
        self.dispatch_due_subscriptions(now, &mut summary).await;

        debug!(
            sent = summary.sent,
            failed = summary.failed,
            already_done = summary.already_done,
            held = summary.held,
            skipped = summary.skipped,
            "Scheduler pass complete"
        );
        summary
    }

    // ── Countdown scan ──────────────────────────────────────────────

    /// Materialize due-items for countdown automations whose fire date is
    /// today (or within the grace window). The upsert is keyed by
    /// (rule, subject, anchor date), so repeated ticks are no-ops.
    async fn scan_countdowns(&self, now: DateTime<Utc>) {
        let countdowns = match self.store.list_enabled_countdowns().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to load countdown automations: {e}");
                return;
            }
        };

        for automation in countdowns {
            let AutomationKind::Countdown {
                anchor,
                days_before,
                content,
            } = &automation.kind
            else {
                continue;
            };
            let (anchor, days_before) = (*anchor, *days_before);

            let send_hour = self.tenant_send_hour(automation.tenant_id).await;
            let today = now.date_naive();
            let from = today + Duration::days(days_before - self.config.countdown_grace_days);
            let to = today + Duration::days(days_before + self.config.countdown_horizon_days);

            let subjects = match self
                .calendar
                .subjects_with_event_between(automation.tenant_id, anchor, from, to)
                .await
            {
                Ok(list) => list,
                Err(e) => {
                    warn!(automation = %automation.name, "Calendar scan failed: {e}");
                    continue;
                }
            };

            for (subject_id, anchor_date) in subjects {
                let Some(fire_at) = timing::resolve_countdown(
                    anchor_date,
                    days_before,
                    send_hour,
                    now,
                    self.config.countdown_grace_days,
                ) else {
                    continue;
                };

                let occurrence_key = countdown_occurrence_key(anchor_date);
                let rule = RuleRef::Automation(automation.id);
                match self
                    .store
                    .has_successful_execution(&rule, subject_id, &occurrence_key)
                    .await
                {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(automation = %automation.name, "Idempotency pre-check failed: {e}");
                        continue;
                    }
                }

                let item = DueItem {
                    id: Uuid::new_v4(),
                    tenant_id: automation.tenant_id,
                    automation_id: automation.id,
                    step_index: None,
                    subject_id,
                    channel: automation.channel,
                    content: content.clone(),
                    occurrence_key,
                    fire_at,
                    created_at: now,
                };
                match self.store.upsert_due_item(&item).await {
                    Ok(true) => debug!(
                        automation = %automation.name,
                        subject_id = %subject_id,
                        fire_at = %fire_at,
                        "Countdown due-item created"
                    ),
                    Ok(false) => {}
                    Err(e) => warn!(automation = %automation.name, "Failed to persist due-item: {e}"),
                }
            }
        }
    }

    // ── Due-items ───────────────────────────────────────────────────

    async fn dispatch_due_items(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        let items = match self.store.list_due_items(now).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to load due items: {e}");
                return;
            }
        };

        for item in items {
            // A rule disabled after the item was persisted still fires; the
            // audit row carries the anomaly instead of the send being
            // suppressed.
            let anomaly = match self
                .store
                .get_automation(item.tenant_id, item.automation_id)
                .await
            {
                Ok(Some(a)) if !a.enabled => Some("disabled-after-fire".to_string()),
                Ok(Some(_)) => None,
                Ok(None) => {
                    warn!(
                        automation_id = %item.automation_id,
                        "Due item references missing automation, dropping"
                    );
                    let _ = self.store.delete_due_item(item.id).await;
                    continue;
                }
                Err(e) => {
                    warn!(automation_id = %item.automation_id, "Failed to load automation: {e}");
                    continue;
                }
            };

            let action = AutomationAction {
                tenant_id: item.tenant_id,
                automation_id: item.automation_id,
                subject_id: item.subject_id,
                channel: item.channel,
                content: item.content.clone(),
                target_stage: None,
                occurrence_key: item.occurrence_key.clone(),
                anomaly,
            };

            match self.execute(&action).await {
                DispatchResult::Sent => {
                    summary.sent += 1;
                    let _ = self.store.delete_due_item(item.id).await;
                }
                DispatchResult::AlreadyDone => {
                    summary.already_done += 1;
                    let _ = self.store.delete_due_item(item.id).await;
                }
                // Failed and config-skipped items stay due and retry on the
                // next pass.
                DispatchResult::Failed => summary.failed += 1,
                DispatchResult::ConfigSkipped => {}
            }
        }
    }

    // ── Drip subscriptions ──────────────────────────────────────────

    async fn dispatch_due_subscriptions(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        let subscriptions = match self.store.list_due_subscriptions(now).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to load due subscriptions: {e}");
                return;
            }
        };

        for subscription in subscriptions {
            if let Err(e) = self.process_subscription(&subscription, summary).await {
                warn!(
                    subscription_id = %subscription.id,
                    "Subscription processing failed: {e}"
                );
            }
        }
    }

    async fn process_subscription(
        &self,
        subscription: &Subscription,
        summary: &mut PassSummary,
    ) -> Result<(), crate::error::Error> {
        let campaign = match self
            .store
            .get_campaign(subscription.tenant_id, subscription.campaign_id)
            .await?
        {
            Some(c) => c,
            None => {
                warn!(
                    campaign_id = %subscription.campaign_id,
                    "Subscription references missing campaign, holding"
                );
                summary.held += 1;
                return Ok(());
            }
        };

        if campaign.status != CampaignStatus::Active {
            debug!(campaign = %campaign.name, "Campaign not active, holding subscription");
            summary.held += 1;
            return Ok(());
        }

        let emails = self.store.list_campaign_emails(campaign.id).await?;
        let index = subscription.next_email_index;
        let Some(email) = emails.get(index as usize) else {
            // Sequence exhausted.
            self.store
                .advance_subscription(subscription.id, index, None, SubscriptionStatus::Completed)
                .await?;
            return Ok(());
        };

        match email.approval {
            EmailApproval::Pending => {
                // Hold: no advance, no skip, until an operator decides.
                debug!(
                    campaign = %campaign.name,
                    email_index = index,
                    "Next drip email pending approval, holding"
                );
                summary.held += 1;
                Ok(())
            }
            EmailApproval::Rejected => {
                // Consume the step without sending so the campaign doesn't
                // stall forever on dead content.
                let record = ExecutionRecord::new(
                    subscription.tenant_id,
                    RuleRef::Campaign(campaign.id),
                    subscription.project_id,
                    email_occurrence_key(index),
                    ChannelKind::Email,
                    ExecutionStatus::Skipped,
                )
                .with_detail("email rejected by operator");
                let _ = self.store.insert_execution(&record).await;
                self.advance_cursor(subscription, &emails).await?;
                summary.skipped += 1;
                Ok(())
            }
            EmailApproval::Approved => {
                self.send_drip_email(subscription, &campaign.name, email, &emails, summary)
                    .await
            }
        }
    }

    async fn send_drip_email(
        &self,
        subscription: &Subscription,
        campaign_name: &str,
        email: &DripCampaignEmail,
        emails: &[DripCampaignEmail],
        summary: &mut PassSummary,
    ) -> Result<(), crate::error::Error> {
        let rule = RuleRef::Campaign(subscription.campaign_id);
        let occurrence_key = email_occurrence_key(email.email_index);

        // Lost-race catch-up: another instance already sent this index but
        // our cursor read was stale. Advance without re-sending.
        if self
            .store
            .has_successful_execution(&rule, subscription.project_id, &occurrence_key)
            .await?
        {
            summary.already_done += 1;
            self.advance_cursor(subscription, emails).await?;
            return Ok(());
        }

        let profile = match self
            .load_profile(subscription.tenant_id, subscription.project_id)
            .await
        {
            Ok(p) => p,
            Err(detail) => {
                let record = ExecutionRecord::new(
                    subscription.tenant_id,
                    rule,
                    subscription.project_id,
                    occurrence_key,
                    ChannelKind::Email,
                    ExecutionStatus::Failed,
                )
                .with_detail(detail);
                let _ = self.store.insert_execution(&record).await;
                summary.failed += 1;
                return Ok(());
            }
        };

        let request = DeliveryRequest {
            tenant_id: subscription.tenant_id,
            subject_id: subscription.project_id,
            channel: ChannelKind::Email,
            content: ResolvedContent {
                subject: Some(self.content.render(&email.subject, &profile)),
                body: self.content.render(&email.body, &profile),
            },
            target_stage: None,
        };

        match self.router.deliver(&request).await {
            DeliveryOutcome::Delivered {
                provider_message_id,
            } => {
                let record = ExecutionRecord::new(
                    subscription.tenant_id,
                    rule,
                    subscription.project_id,
                    email_occurrence_key(email.email_index),
                    ChannelKind::Email,
                    ExecutionStatus::Sent,
                )
                .with_provider_message_id(provider_message_id);

                let inserted = self.store.insert_execution(&record).await?;
                if inserted {
                    summary.sent += 1;
                    debug!(
                        campaign = %campaign_name,
                        project_id = %subscription.project_id,
                        email_index = email.email_index,
                        "Drip email sent"
                    );
                } else {
                    // Another instance claimed the send; our delivery was a
                    // best-effort duplicate. The cursor still advances.
                    summary.already_done += 1;
                }
                self.advance_cursor(subscription, emails).await?;
                Ok(())
            }
            DeliveryOutcome::Retryable { error } | DeliveryOutcome::Failed { error } => {
                let record = ExecutionRecord::new(
                    subscription.tenant_id,
                    rule,
                    subscription.project_id,
                    email_occurrence_key(email.email_index),
                    ChannelKind::Email,
                    ExecutionStatus::Failed,
                )
                .with_detail(error);
                let _ = self.store.insert_execution(&record).await;
                summary.failed += 1;
                // No advance: the item stays due and retries next pass.
                Ok(())
            }
        }
    }

    /// Move the cursor past `subscription.next_email_index`, completing the
    /// subscription when the sequence is exhausted.
    async fn advance_cursor(
        &self,
        subscription: &Subscription,
        emails: &[DripCampaignEmail],
    ) -> Result<(), crate::error::Error> {
        let next = subscription.next_email_index + 1;
        match timing::resolve_step_time(subscription.started_at, emails, next) {
            Some(next_at) => {
                self.store
                    .advance_subscription(
                        subscription.id,
                        next,
                        Some(next_at),
                        SubscriptionStatus::Active,
                    )
                    .await?
            }
            None => {
                self.store
                    .advance_subscription(subscription.id, next, None, SubscriptionStatus::Completed)
                    .await?
            }
        }
        Ok(())
    }

    // ── Single-action execution ─────────────────────────────────────

    /// Execute one automation action exactly once.
    ///
    /// Pre-checks the execution log, delivers, then claims success with a
    /// conditional insert. The insert is authoritative: losing it means
    /// another instance completed the same occurrence first.
    pub async fn execute(&self, action: &AutomationAction) -> DispatchResult {
        let rule = RuleRef::Automation(action.automation_id);

        match self
            .store
            .has_successful_execution(&rule, action.subject_id, &action.occurrence_key)
            .await
        {
            Ok(true) => return DispatchResult::AlreadyDone,
            Ok(false) => {}
            Err(e) => {
                warn!(automation_id = %action.automation_id, "Idempotency pre-check failed: {e}");
                return DispatchResult::Failed;
            }
        }

        let content = match self.resolve_action_content(action).await {
            Ok(content) => content,
            Err(ResolveError::Config(e)) => {
                warn!(
                    automation_id = %action.automation_id,
                    subject_id = %action.subject_id,
                    "Skipping action with invalid content: {e}"
                );
                return DispatchResult::ConfigSkipped;
            }
            Err(ResolveError::Delivery(detail)) => {
                let record = ExecutionRecord::new(
                    action.tenant_id,
                    rule,
                    action.subject_id,
                    action.occurrence_key.clone(),
                    action.channel,
                    ExecutionStatus::Failed,
                )
                .with_detail(detail);
                let _ = self.store.insert_execution(&record).await;
                return DispatchResult::Failed;
            }
        };

        let request = DeliveryRequest {
            tenant_id: action.tenant_id,
            subject_id: action.subject_id,
            channel: action.channel,
            content,
            target_stage: action.target_stage,
        };

        match self.router.deliver(&request).await {
            DeliveryOutcome::Delivered {
                provider_message_id,
            } => {
                let mut record = ExecutionRecord::new(
                    action.tenant_id,
                    rule,
                    action.subject_id,
                    action.occurrence_key.clone(),
                    action.channel,
                    ExecutionStatus::Sent,
                )
                .with_provider_message_id(provider_message_id);
                if let Some(anomaly) = &action.anomaly {
                    record = record.with_anomaly(anomaly.clone());
                }

                match self.store.insert_execution(&record).await {
                    Ok(true) => DispatchResult::Sent,
                    Ok(false) => {
                        debug!(
                            automation_id = %action.automation_id,
                            occurrence = %action.occurrence_key,
                            "Duplicate delivery suppressed post hoc"
                        );
                        DispatchResult::AlreadyDone
                    }
                    Err(e) => {
                        warn!(automation_id = %action.automation_id, "Failed to record execution: {e}");
                        DispatchResult::Failed
                    }
                }
            }
            DeliveryOutcome::Retryable { error } | DeliveryOutcome::Failed { error } => {
                let mut record = ExecutionRecord::new(
                    action.tenant_id,
                    rule,
                    action.subject_id,
                    action.occurrence_key.clone(),
                    action.channel,
                    ExecutionStatus::Failed,
                )
                .with_detail(error);
                if let Some(anomaly) = &action.anomaly {
                    record = record.with_anomaly(anomaly.clone());
                }
                let _ = self.store.insert_execution(&record).await;
                DispatchResult::Failed
            }
        }
    }

    async fn resolve_action_content(
        &self,
        action: &AutomationAction,
    ) -> Result<ResolvedContent, ResolveError> {
        // Stage mutation carries no content.
        if action.channel == ChannelKind::StateChange {
            return Ok(ResolvedContent {
                subject: None,
                body: String::new(),
            });
        }

        let profile = self
            .load_profile(action.tenant_id, action.subject_id)
            .await
            .map_err(ResolveError::Delivery)?;

        self.content
            .resolve(action.tenant_id, &action.content, &profile)
            .await
            .map_err(ResolveError::Config)
    }

    async fn load_profile(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
    ) -> Result<SubjectProfile, String> {
        match self.directory.profile(tenant_id, subject_id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => Err(format!("subject {subject_id} not found in directory")),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn tenant_send_hour(&self, tenant_id: Uuid) -> u32 {
        match self.store.send_hour(tenant_id).await {
            Ok(Some(hour)) => hour,
            Ok(None) => self.config.default_send_hour,
            Err(e) => {
                warn!(tenant_id = %tenant_id, "Failed to load tenant send hour: {e}");
                self.config.default_send_hour
            }
        }
    }
}

enum ResolveError {
    /// Rule misconfiguration — skip and log, never an audit failure.
    Config(crate::error::RuleError),
    /// Transient lookup problem — recorded as a failed attempt.
    Delivery(String),
}
