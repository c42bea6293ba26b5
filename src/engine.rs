//! The automation engine — ties the evaluator, timing resolver, and
//! dispatcher together behind one composition root.
//!
//! `handle_event` is the entry point for stage changes and business events:
//! zero-delay matches execute inline within the same evaluation pass, and
//! everything else becomes a persisted due-item for the scheduler. Events
//! are fire-and-forget: evaluation failures are logged, never returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::model::{Automation, AutomationKind, Content, DelaySpec};
use crate::campaign::model::{CampaignStatus, DripCampaign};
use crate::campaign::subscription::{Subscription, SubscriptionStatus};
use crate::channels::{ChannelKind, DeliveryRouter};
use crate::collab::{EventCalendar, Pipeline, SubjectDirectory};
use crate::config::EngineConfig;
use crate::dispatch::dispatcher::{AutomationAction, Dispatcher, PassSummary};
use crate::dispatch::model::{event_occurrence_key, DueItem};
use crate::error::{Error, RuleError};
use crate::store::Store;
use crate::timing::{self, Resolution};
use crate::trigger::{TriggerEvaluator, TriggerEvent, TriggerKind};

/// The automation and campaign scheduling engine.
pub struct Engine {
    store: Arc<dyn Store>,
    evaluator: TriggerEvaluator,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        router: Arc<DeliveryRouter>,
        pipeline: Arc<dyn Pipeline>,
        calendar: Arc<dyn EventCalendar>,
        directory: Arc<dyn SubjectDirectory>,
    ) -> Self {
        let evaluator = TriggerEvaluator::new(
            store.clone(),
            pipeline,
            config.duplicate_stage_policy,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            store.clone(),
            router,
            calendar,
            directory,
        ));
        Self {
            store,
            evaluator,
            dispatcher,
        }
    }

    /// The dispatcher, for the background ticker.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Run one scheduler pass now. The pass is a pure function over
    /// (now, persisted state); it is safe to call concurrently.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassSummary {
        self.dispatcher.run_pass(now).await
    }

    // ── Event intake ────────────────────────────────────────────────

    /// Evaluate an event against the rule store and act on every match.
    pub async fn handle_event(&self, event: &TriggerEvent) {
        let matches = self.evaluator.matches_for(event).await;
        for automation in &matches {
            self.process_match(automation, event).await;
        }

        if let TriggerKind::StageEntered {
            stage_id,
            project_type,
        } = &event.kind
        {
            self.enroll_matching_campaigns(event, *stage_id, project_type.as_deref())
                .await;
        }
    }

    async fn process_match(&self, automation: &Automation, event: &TriggerEvent) {
        match &automation.kind {
            AutomationKind::StageChange { target_stage } => {
                // Immediate by definition: write the new stage, append the
                // audit row, no delay resolution involved.
                let action = AutomationAction {
                    tenant_id: event.tenant_id,
                    automation_id: automation.id,
                    subject_id: event.subject_id,
                    channel: ChannelKind::StateChange,
                    content: Content::Inline {
                        subject: None,
                        body: String::new(),
                    },
                    target_stage: Some(*target_stage),
                    occurrence_key: event_occurrence_key(event, None),
                    anomaly: None,
                };
                self.dispatcher.execute(&action).await;
            }
            AutomationKind::Communication { content, delay } => {
                let steps = match self.store.list_automation_steps(automation.id).await {
                    Ok(steps) => steps,
                    Err(e) => {
                        warn!(automation = %automation.name, "Failed to load steps: {e}");
                        return;
                    }
                };

                if steps.is_empty() {
                    self.schedule_communication(
                        automation,
                        event,
                        None,
                        automation.channel,
                        content,
                        delay,
                    )
                    .await;
                } else {
                    for step in &steps {
                        if let Err(e) = step.validate() {
                            warn!(automation = %automation.name, "Skipping invalid step: {e}");
                            continue;
                        }
                        self.schedule_communication(
                            automation,
                            event,
                            Some(step.step_index),
                            step.channel,
                            &step.content,
                            &step.delay,
                        )
                        .await;
                    }
                }
            }
            AutomationKind::Countdown { .. } => {
                // Clock-driven; the dispatcher scans these each tick.
                debug!(automation = %automation.name, "Countdown ignored for event trigger");
            }
        }
    }

    /// Zero-delay communications execute inline; delayed ones persist a
    /// due-item with a fire time relative to the trigger, which is also
    /// what keeps multi-step sequences in index order.
    async fn schedule_communication(
        &self,
        automation: &Automation,
        event: &TriggerEvent,
        step_index: Option<u32>,
        channel: ChannelKind,
        content: &Content,
        delay: &DelaySpec,
    ) {
        let occurrence_key = event_occurrence_key(event, step_index);

        match timing::resolve_communication(delay, event.occurred_at) {
            Resolution::Immediate => {
                let action = AutomationAction {
                    tenant_id: event.tenant_id,
                    automation_id: automation.id,
                    subject_id: event.subject_id,
                    channel,
                    content: content.clone(),
                    target_stage: None,
                    occurrence_key,
                    anomaly: None,
                };
                self.dispatcher.execute(&action).await;
            }
            Resolution::At(fire_at) => {
                let item = DueItem {
                    id: Uuid::new_v4(),
                    tenant_id: event.tenant_id,
                    automation_id: automation.id,
                    step_index,
                    subject_id: event.subject_id,
                    channel,
                    content: content.clone(),
                    occurrence_key,
                    fire_at,
                    created_at: Utc::now(),
                };
                match self.store.upsert_due_item(&item).await {
                    Ok(true) => debug!(
                        automation = %automation.name,
                        subject_id = %event.subject_id,
                        fire_at = %fire_at,
                        "Due-item persisted"
                    ),
                    Ok(false) => debug!(
                        automation = %automation.name,
                        "Due-item already pending for this occurrence"
                    ),
                    Err(e) => warn!(automation = %automation.name, "Failed to persist due-item: {e}"),
                }
            }
        }
    }

    // ── Campaign enrollment ─────────────────────────────────────────

    async fn enroll_matching_campaigns(
        &self,
        event: &TriggerEvent,
        stage_id: Uuid,
        project_type: Option<&str>,
    ) {
        let campaigns = self
            .evaluator
            .campaigns_for_stage_entry(event.tenant_id, stage_id, project_type)
            .await;

        for campaign in &campaigns {
            if let Err(e) = self
                .enroll_project(campaign, event.subject_id, event.occurred_at)
                .await
            {
                warn!(campaign = %campaign.name, "Enrollment failed: {e}");
            }
        }
    }

    async fn enroll_project(
        &self,
        campaign: &DripCampaign,
        project_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Subscription>, Error> {
        let emails = self.store.list_campaign_emails(campaign.id).await?;
        let first_at = timing::resolve_step_time(started_at, &emails, 0);
        let subscription = Subscription::new(
            campaign.tenant_id,
            campaign.id,
            project_id,
            started_at,
            first_at,
        );

        let created = self.store.create_subscription(&subscription).await?;
        if created {
            info!(
                campaign = %campaign.name,
                project_id = %project_id,
                "Project enrolled in drip campaign"
            );
            Ok(Some(subscription))
        } else {
            debug!(
                campaign = %campaign.name,
                project_id = %project_id,
                "Project already enrolled"
            );
            Ok(None)
        }
    }

    /// Manually enroll a project into a campaign (operator action).
    pub async fn enroll(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        project_id: Uuid,
    ) -> Result<Option<Subscription>, Error> {
        let campaign = self
            .store
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or(crate::error::DatabaseError::NotFound {
                entity: "campaign".to_string(),
                id: campaign_id.to_string(),
            })?;

        if campaign.status != CampaignStatus::Active {
            return Err(RuleError::InvalidTransition {
                from: campaign.status.to_string(),
                to: "enrollment".to_string(),
            }
            .into());
        }

        self.enroll_project(&campaign, project_id, Utc::now()).await
    }

    // ── Operator transitions ────────────────────────────────────────

    /// Move a campaign through its lifecycle, enforcing the state machine.
    pub async fn transition_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        target: CampaignStatus,
    ) -> Result<(), Error> {
        let campaign = self
            .store
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or(crate::error::DatabaseError::NotFound {
                entity: "campaign".to_string(),
                id: campaign_id.to_string(),
            })?;

        if !campaign.status.can_transition_to(target) {
            return Err(RuleError::InvalidTransition {
                from: campaign.status.to_string(),
                to: target.to_string(),
            }
            .into());
        }

        self.store
            .set_campaign_status(tenant_id, campaign_id, target)
            .await?;
        info!(campaign = %campaign.name, status = %target, "Campaign transitioned");
        Ok(())
    }

    /// Pause, resume, or unsubscribe a subscription. Takes effect on the
    /// next scheduler pass; the cursor is never touched.
    pub async fn transition_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        target: SubscriptionStatus,
    ) -> Result<(), Error> {
        let subscription = self
            .store
            .get_subscription(tenant_id, subscription_id)
            .await?
            .ok_or(crate::error::DatabaseError::NotFound {
                entity: "subscription".to_string(),
                id: subscription_id.to_string(),
            })?;

        if !subscription.status.can_transition_to(target) {
            return Err(RuleError::InvalidTransition {
                from: subscription.status.to_string(),
                to: target.to_string(),
            }
            .into());
        }

        self.store
            .set_subscription_status(tenant_id, subscription_id, target)
            .await?;
        info!(
            subscription_id = %subscription_id,
            status = %target,
            "Subscription transitioned"
        );
        Ok(())
    }
}
