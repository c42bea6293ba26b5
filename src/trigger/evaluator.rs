//! Trigger evaluator — decides which enabled rules are relevant for an
//! event.
//!
//! Failure semantics: a malformed or half-configured rule is skipped and
//! logged as an invalid-rule warning. One bad rule never aborts evaluation
//! for the rest of the batch; store and collaborator errors degrade to
//! empty match sets the same way.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::automation::model::{Automation, AutomationKind, Scope};
use crate::campaign::model::DripCampaign;
use crate::collab::Pipeline;
use crate::config::DuplicateStagePolicy;
use crate::store::Store;
use crate::trigger::{TriggerEvent, TriggerKind};

/// Matches events against the rule store.
pub struct TriggerEvaluator {
    store: Arc<dyn Store>,
    pipeline: Arc<dyn Pipeline>,
    policy: DuplicateStagePolicy,
}

impl TriggerEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<dyn Pipeline>,
        policy: DuplicateStagePolicy,
    ) -> Self {
        Self {
            store,
            pipeline,
            policy,
        }
    }

    /// All enabled automations relevant for this event.
    ///
    /// Countdown automations are clock-driven and never match here; the
    /// dispatcher scans them each tick.
    pub async fn matches_for(&self, event: &TriggerEvent) -> Vec<Automation> {
        match &event.kind {
            TriggerKind::StageEntered {
                stage_id,
                project_type,
            } => {
                self.stage_entry_matches(event.tenant_id, *stage_id, project_type.as_deref())
                    .await
            }
            TriggerKind::BusinessEvent { event_type } => {
                self.business_event_matches(event, *event_type).await
            }
            TriggerKind::ClockTick => Vec::new(),
        }
    }

    /// Stage entry matches automations scoped to that stage OR scoped
    /// globally (global rules fire on entry to *any* stage of a matching
    /// project type).
    async fn stage_entry_matches(
        &self,
        tenant_id: Uuid,
        stage_id: Uuid,
        project_type: Option<&str>,
    ) -> Vec<Automation> {
        let automations = match self.store.list_enabled_automations(tenant_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(tenant_id = %tenant_id, "Failed to load automations: {e}");
                return Vec::new();
            }
        };

        // Automations bound to a business trigger are event-driven; they do
        // not also fire on stage entry.
        let triggered = match self.store.list_triggered_automation_ids(tenant_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(tenant_id = %tenant_id, "Failed to load trigger bindings: {e}");
                Vec::new()
            }
        };

        let mut matched: Vec<Automation> = automations
            .into_iter()
            .filter(|a| !matches!(a.kind, AutomationKind::Countdown { .. }))
            .filter(|a| !triggered.contains(&a.id))
            .filter(|a| match a.scope {
                Scope::Stage(s) => s == stage_id,
                Scope::Global => true,
            })
            .filter(|a| a.matches_project_type(project_type))
            .collect();

        if self.policy == DuplicateStagePolicy::PreferStageSpecific {
            let specific_channels: Vec<_> = matched
                .iter()
                .filter(|a| matches!(a.scope, Scope::Stage(_)))
                .map(|a| a.channel)
                .collect();
            matched.retain(|a| {
                a.scope != Scope::Global || !specific_channels.contains(&a.channel)
            });
        }

        debug!(
            tenant_id = %tenant_id,
            stage_id = %stage_id,
            matched = matched.len(),
            "Stage entry evaluated"
        );
        matched
    }

    /// Business events match through BusinessTrigger bindings, optionally
    /// constrained to subjects currently in a specific stage.
    async fn business_event_matches(
        &self,
        event: &TriggerEvent,
        event_type: crate::automation::model::BusinessEventType,
    ) -> Vec<Automation> {
        let triggers = match self
            .store
            .list_business_triggers(event.tenant_id, event_type)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(tenant_id = %event.tenant_id, "Failed to load business triggers: {e}");
                return Vec::new();
            }
        };

        let mut matched = Vec::new();
        for trigger in triggers {
            let automation = match self
                .store
                .get_automation(event.tenant_id, trigger.automation_id)
                .await
            {
                Ok(Some(a)) => a,
                Ok(None) => {
                    warn!(
                        automation_id = %trigger.automation_id,
                        "Business trigger references missing automation, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        automation_id = %trigger.automation_id,
                        "Failed to load automation for business trigger: {e}"
                    );
                    continue;
                }
            };

            if !automation.enabled {
                continue;
            }

            // Optional source-stage constraint; absence means any stage.
            if let Some(required_stage) = trigger.source_stage {
                match self
                    .pipeline
                    .subject_stage(event.tenant_id, event.subject_id)
                    .await
                {
                    Ok(Some(current)) if current == required_stage => {}
                    Ok(_) => {
                        debug!(
                            automation = %automation.name,
                            subject_id = %event.subject_id,
                            "Skipped: subject not in required source stage"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            automation = %automation.name,
                            "Failed to check source stage, skipping: {e}"
                        );
                        continue;
                    }
                }
            }

            matched.push(automation);
        }

        debug!(
            tenant_id = %event.tenant_id,
            event = %event_type,
            matched = matched.len(),
            "Business event evaluated"
        );
        matched
    }

    /// Active campaigns whose target stage and project type match a stage
    /// entry — candidates for enrollment.
    pub async fn campaigns_for_stage_entry(
        &self,
        tenant_id: Uuid,
        stage_id: Uuid,
        project_type: Option<&str>,
    ) -> Vec<DripCampaign> {
        let campaigns = match self
            .store
            .list_active_campaigns_for_stage(tenant_id, stage_id)
            .await
        {
            Ok(list) => list,
            Err(e) => {
                warn!(tenant_id = %tenant_id, "Failed to load campaigns: {e}");
                return Vec::new();
            }
        };

        campaigns
            .into_iter()
            .filter(|c| project_type == Some(c.project_type.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::model::{
        AutomationKind, BusinessEventType, BusinessTrigger, Content, DelaySpec,
    };
    use crate::channels::ChannelKind;
    use crate::store::{LibSqlStore, StoreCollaborators};
    use chrono::Utc;

    struct Fixture {
        store: Arc<dyn Store>,
        tenant: Uuid,
    }

    impl Fixture {
        async fn new() -> Self {
            Self {
                store: Arc::new(LibSqlStore::new_memory().await.unwrap()),
                tenant: Uuid::new_v4(),
            }
        }

        fn evaluator(&self, policy: DuplicateStagePolicy) -> TriggerEvaluator {
            let pipeline = Arc::new(StoreCollaborators::new(self.store.clone()));
            TriggerEvaluator::new(self.store.clone(), pipeline, policy)
        }

        async fn add_automation(
            &self,
            name: &str,
            scope: Scope,
            channel: ChannelKind,
            kind: AutomationKind,
        ) -> Automation {
            let now = Utc::now();
            let automation = Automation {
                id: Uuid::new_v4(),
                tenant_id: self.tenant,
                name: name.to_string(),
                scope,
                project_type: None,
                channel,
                enabled: true,
                kind,
                created_at: now,
                updated_at: now,
            };
            self.store.create_automation(&automation).await.unwrap();
            automation
        }
    }

    fn email_kind() -> AutomationKind {
        AutomationKind::Communication {
            content: Content::Inline {
                subject: None,
                body: "hi".to_string(),
            },
            delay: DelaySpec::default(),
        }
    }

    #[tokio::test]
    async fn stage_entry_matches_specific_and_global() {
        let fx = Fixture::new().await;
        let stage = Uuid::new_v4();
        fx.add_automation("specific", Scope::Stage(stage), ChannelKind::Email, email_kind())
            .await;
        fx.add_automation("global", Scope::Global, ChannelKind::Email, email_kind())
            .await;
        fx.add_automation(
            "other stage",
            Scope::Stage(Uuid::new_v4()),
            ChannelKind::Email,
            email_kind(),
        )
        .await;

        let evaluator = fx.evaluator(DuplicateStagePolicy::FireBoth);
        let event = TriggerEvent::stage_entered(fx.tenant, Uuid::new_v4(), stage, None);
        let matched = evaluator.matches_for(&event).await;

        // Observed CRM behavior: both the global and the stage-specific
        // automation fire for the same entry.
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn prefer_stage_specific_suppresses_global_same_channel() {
        let fx = Fixture::new().await;
        let stage = Uuid::new_v4();
        fx.add_automation("specific", Scope::Stage(stage), ChannelKind::Email, email_kind())
            .await;
        fx.add_automation("global email", Scope::Global, ChannelKind::Email, email_kind())
            .await;
        fx.add_automation("global sms", Scope::Global, ChannelKind::Sms, email_kind())
            .await;

        let evaluator = fx.evaluator(DuplicateStagePolicy::PreferStageSpecific);
        let event = TriggerEvent::stage_entered(fx.tenant, Uuid::new_v4(), stage, None);
        let matched = evaluator.matches_for(&event).await;

        let names: Vec<_> = matched.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"specific"));
        assert!(names.contains(&"global sms"));
        assert!(!names.contains(&"global email"));
    }

    #[tokio::test]
    async fn countdowns_never_match_stage_entry() {
        let fx = Fixture::new().await;
        let stage = Uuid::new_v4();
        fx.add_automation(
            "countdown",
            Scope::Global,
            ChannelKind::Sms,
            AutomationKind::Countdown {
                anchor: crate::automation::model::AnchorEvent::WeddingDate,
                days_before: 7,
                content: Content::Inline {
                    subject: None,
                    body: "soon".to_string(),
                },
            },
        )
        .await;

        let evaluator = fx.evaluator(DuplicateStagePolicy::FireBoth);
        let event = TriggerEvent::stage_entered(fx.tenant, Uuid::new_v4(), stage, None);
        assert!(evaluator.matches_for(&event).await.is_empty());
    }

    #[tokio::test]
    async fn business_triggered_automations_skip_stage_matching() {
        let fx = Fixture::new().await;
        let stage = Uuid::new_v4();
        let bound = fx
            .add_automation(
                "on booking",
                Scope::Global,
                ChannelKind::StateChange,
                AutomationKind::StageChange {
                    target_stage: Uuid::new_v4(),
                },
            )
            .await;
        fx.store
            .create_business_trigger(&BusinessTrigger {
                id: Uuid::new_v4(),
                automation_id: bound.id,
                event_type: BusinessEventType::AppointmentBooked,
                source_stage: None,
            })
            .await
            .unwrap();

        let evaluator = fx.evaluator(DuplicateStagePolicy::FireBoth);
        let event = TriggerEvent::stage_entered(fx.tenant, Uuid::new_v4(), stage, None);
        assert!(evaluator.matches_for(&event).await.is_empty());

        let event =
            TriggerEvent::business_event(fx.tenant, Uuid::new_v4(), BusinessEventType::AppointmentBooked);
        assert_eq!(evaluator.matches_for(&event).await.len(), 1);
    }

    #[tokio::test]
    async fn clock_tick_matches_nothing_here() {
        let fx = Fixture::new().await;
        fx.add_automation("welcome", Scope::Global, ChannelKind::Email, email_kind())
            .await;

        let evaluator = fx.evaluator(DuplicateStagePolicy::FireBoth);
        let event = TriggerEvent {
            tenant_id: fx.tenant,
            subject_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind: TriggerKind::ClockTick,
        };
        assert!(evaluator.matches_for(&event).await.is_empty());
    }
}
