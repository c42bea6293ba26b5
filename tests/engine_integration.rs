//! End-to-end engine tests: in-memory store, store-backed collaborators,
//! recording mock transports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use studioflow::automation::model::{
    AnchorEvent, Automation, AutomationKind, AutomationStep, BusinessEventType, BusinessTrigger,
    ClockTime, Content, DelaySpec, Scope,
};
use studioflow::campaign::model::{
    CampaignStatus, DripCampaign, DripCampaignEmail, EmailApproval, StepOffset,
};
use studioflow::campaign::subscription::SubscriptionStatus;
use studioflow::channels::{ChannelKind, DeliveryRouter};
use studioflow::collab::{EmailTransport, SmsTransport, TransportReceipt};
use studioflow::config::EngineConfig;
use studioflow::dispatch::ExecutionStatus;
use studioflow::engine::Engine;
use studioflow::error::ChannelError;
use studioflow::store::{LibSqlStore, Store, StoreCollaborators, SubjectRecord};
use studioflow::trigger::TriggerEvent;

// ── Mock transports ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SentEmail {
    to: String,
    subject: String,
    body: String,
}

#[derive(Default)]
struct RecordingEmail {
    sent: Mutex<Vec<SentEmail>>,
    fail: AtomicBool,
}

impl RecordingEmail {
    fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailTransport for RecordingEmail {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<TransportReceipt, ChannelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                channel: "email".into(),
                reason: "provider timeout".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(TransportReceipt {
            provider_message_id: Some(format!("email-{}", sent.len())),
        })
    }
}

#[derive(Default)]
struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmsTransport for RecordingSms {
    async fn send(&self, to: &str, body: &str) -> Result<TransportReceipt, ChannelError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(TransportReceipt {
            provider_message_id: Some(format!("sms-{}", sent.len())),
        })
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<dyn Store>,
    engine: Arc<Engine>,
    email: Arc<RecordingEmail>,
    sms: Arc<RecordingSms>,
    tenant: Uuid,
}

async fn harness() -> Harness {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let collaborators = Arc::new(StoreCollaborators::new(store.clone()));
    let email = Arc::new(RecordingEmail::default());
    let sms = Arc::new(RecordingSms::default());

    let router = Arc::new(DeliveryRouter::new(
        Some(email.clone() as Arc<dyn EmailTransport>),
        Some(sms.clone() as Arc<dyn SmsTransport>),
        None,
        collaborators.clone(),
        collaborators.clone(),
    ));
    let engine = Arc::new(Engine::new(
        EngineConfig::default(),
        store.clone(),
        router,
        collaborators.clone(),
        collaborators.clone(),
        collaborators,
    ));

    Harness {
        store,
        engine,
        email,
        sms,
        tenant: Uuid::new_v4(),
    }
}

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

impl Harness {
    async fn seed_subject(&self, stage: Option<Uuid>, wedding: Option<NaiveDate>) -> Uuid {
        let subject = SubjectRecord {
            id: Uuid::new_v4(),
            tenant_id: self.tenant,
            first_name: Some("Maya".to_string()),
            email: Some("maya@example.com".to_string()),
            phone: Some("+15550001111".to_string()),
            stage_id: stage,
            project_type: Some("wedding".to_string()),
            wedding_date: wedding,
            session_date: None,
            fields: Default::default(),
        };
        self.store.upsert_subject(&subject).await.unwrap();
        subject.id
    }

    async fn create_email_automation(
        &self,
        scope: Scope,
        delay: DelaySpec,
    ) -> Automation {
        let now = Utc::now();
        let automation = Automation {
            id: Uuid::new_v4(),
            tenant_id: self.tenant,
            name: "inquiry welcome".to_string(),
            scope,
            project_type: Some("wedding".to_string()),
            channel: ChannelKind::Email,
            enabled: true,
            kind: AutomationKind::Communication {
                content: Content::Inline {
                    subject: Some("Welcome {{first_name}}!".to_string()),
                    body: "Hi {{first_name}}, thanks for reaching out.".to_string(),
                },
                delay,
            },
            created_at: now,
            updated_at: now,
        };
        self.store.create_automation(&automation).await.unwrap();
        automation
    }

    async fn create_campaign_with_emails(
        &self,
        target_stage: Uuid,
        offsets: &[StepOffset],
        approval: EmailApproval,
    ) -> DripCampaign {
        let now = Utc::now();
        let campaign = DripCampaign {
            id: Uuid::new_v4(),
            tenant_id: self.tenant,
            name: "wedding nurture".to_string(),
            target_stage,
            project_type: "wedding".to_string(),
            status: CampaignStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.create_campaign(&campaign).await.unwrap();

        for (index, offset) in offsets.iter().enumerate() {
            let email = DripCampaignEmail {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                email_index: index as u32,
                subject: format!("Nurture #{index}"),
                body: format!("Hello {{{{first_name}}}}, this is email {index}."),
                offset: *offset,
                approval,
            };
            self.store.create_campaign_email(&email).await.unwrap();
        }
        campaign
    }

    async fn sent_audit_count(&self, subject: Uuid) -> usize {
        self.store
            .list_subject_history(self.tenant, subject, 100)
            .await
            .unwrap()
            .iter()
            .filter(|r| r.status == ExecutionStatus::Sent)
            .count()
    }
}

// ── Zero-delay automations (spec scenario 1) ────────────────────────

#[tokio::test]
async fn zero_delay_automation_fires_within_evaluation_pass() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let automation = h
        .create_email_automation(Scope::Stage(stage), DelaySpec::default())
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    h.engine.handle_event(&event).await;

    // Exactly one email, personalized, recorded in the audit log.
    let sent = h.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "maya@example.com");
    assert_eq!(sent[0].subject, "Welcome Maya!");

    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Sent);
    assert_eq!(history[0].channel, ChannelKind::Email);
    assert_eq!(history[0].rule.id(), automation.id);

    // No persisted due-item was created.
    let due = h.store.list_due_items(Utc::now() + chrono::Duration::days(365)).await.unwrap();
    assert!(due.is_empty());
}

#[tokio::test]
async fn replaying_the_same_event_does_not_double_send() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    h.create_email_automation(Scope::Stage(stage), DelaySpec::default())
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    h.engine.handle_event(&event).await;
    h.engine.handle_event(&event).await;

    assert_eq!(h.email.sent().len(), 1);
    assert_eq!(h.sent_audit_count(subject).await, 1);
}

#[tokio::test]
async fn global_automation_fires_on_any_stage_entry() {
    let h = harness().await;
    h.create_email_automation(Scope::Global, DelaySpec::default())
        .await;
    let stage = Uuid::new_v4();
    let subject = h.seed_subject(Some(stage), None).await;

    let event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    h.engine.handle_event(&event).await;
    assert_eq!(h.email.sent().len(), 1);

    // Wrong project type does not match.
    let other = h.seed_subject(Some(stage), None).await;
    let event = TriggerEvent::stage_entered(h.tenant, other, stage, Some("portrait".into()));
    h.engine.handle_event(&event).await;
    assert_eq!(h.email.sent().len(), 1);
}

// ── Delayed communications ──────────────────────────────────────────

#[tokio::test]
async fn delayed_communication_persists_and_fires_when_due() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    h.create_email_automation(
        Scope::Stage(stage),
        DelaySpec {
            days: 1,
            ..Default::default()
        },
    )
    .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let trigger_time = utc(2025, 3, 1, 9, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = trigger_time;
    h.engine.handle_event(&event).await;

    // Nothing sent yet; a due-item exists for tomorrow.
    assert!(h.email.sent().is_empty());
    let due = h.store.list_due_items(utc(2025, 3, 2, 10, 0)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].fire_at, utc(2025, 3, 2, 9, 0));

    // Not due before the fire time.
    let summary = h.engine.run_pass(utc(2025, 3, 2, 8, 0)).await;
    assert_eq!(summary.sent, 0);
    assert!(h.email.sent().is_empty());

    // Due after it.
    let summary = h.engine.run_pass(utc(2025, 3, 2, 9, 30)).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(h.email.sent().len(), 1);

    // The item is consumed; a replayed pass sends nothing.
    let summary = h.engine.run_pass(utc(2025, 3, 2, 9, 30)).await;
    assert_eq!(summary.sent, 0);
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn multi_step_automation_fires_in_index_order() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let automation = h
        .create_email_automation(Scope::Stage(stage), DelaySpec::default())
        .await;

    for (index, days) in [0i64, 2].into_iter().enumerate() {
        let step = AutomationStep {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            step_index: index as u32,
            channel: ChannelKind::Email,
            content: Content::Inline {
                subject: Some(format!("Step {index}")),
                body: "…".to_string(),
            },
            delay: DelaySpec {
                days,
                ..Default::default()
            },
        };
        h.store.create_automation_step(&step).await.unwrap();
    }

    let subject = h.seed_subject(Some(stage), None).await;
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = utc(2025, 3, 1, 9, 0);
    h.engine.handle_event(&event).await;

    // Step 0 fired inline; step 1 waits two days.
    assert_eq!(h.email.sent().len(), 1);
    assert_eq!(h.email.sent()[0].subject, "Step 0");

    h.engine.run_pass(utc(2025, 3, 3, 9, 30)).await;
    let sent = h.email.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].subject, "Step 1");
}

#[tokio::test]
async fn pinned_send_hour_defers_to_that_clock_time() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    h.create_email_automation(
        Scope::Stage(stage),
        DelaySpec {
            days: 1,
            send_at: Some(ClockTime { hour: 17, minute: 0 }),
            ..Default::default()
        },
    )
    .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = utc(2025, 3, 1, 9, 0);
    h.engine.handle_event(&event).await;

    let due = h.store.list_due_items(utc(2025, 3, 5, 0, 0)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].fire_at, utc(2025, 3, 2, 17, 0));
}

// ── Countdown automations (spec scenario 2) ─────────────────────────

async fn create_countdown_sms(h: &Harness, days_before: i64) -> Automation {
    let now = Utc::now();
    let automation = Automation {
        id: Uuid::new_v4(),
        tenant_id: h.tenant,
        name: "week-before reminder".to_string(),
        scope: Scope::Global,
        project_type: None,
        channel: ChannelKind::Sms,
        enabled: true,
        kind: AutomationKind::Countdown {
            anchor: AnchorEvent::WeddingDate,
            days_before,
            content: Content::Inline {
                subject: None,
                body: "One week to go, {{first_name}}!".to_string(),
            },
        },
        created_at: now,
        updated_at: now,
    };
    h.store.create_automation(&automation).await.unwrap();
    automation
}

#[tokio::test]
async fn countdown_fires_once_at_tenant_send_hour() {
    let h = harness().await;
    h.store.set_send_hour(h.tenant, 10).await.unwrap();
    create_countdown_sms(&h, 7).await;
    let wedding = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
    let subject = h.seed_subject(None, Some(wedding)).await;

    // The day before the fire date: nothing exists yet.
    h.engine.run_pass(utc(2025, 6, 6, 12, 0)).await;
    assert!(h.store.list_due_items(utc(2025, 6, 30, 0, 0)).await.unwrap().is_empty());

    // Fire day, before the send hour: due-item exists but nothing sent.
    h.engine.run_pass(utc(2025, 6, 7, 8, 0)).await;
    let due = h.store.list_due_items(utc(2025, 6, 30, 0, 0)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].fire_at, utc(2025, 6, 7, 10, 0));
    assert!(h.sms.sent().is_empty());

    // After the send hour: exactly one SMS.
    let summary = h.engine.run_pass(utc(2025, 6, 7, 10, 5)).await;
    assert_eq!(summary.sent, 1);
    let sent = h.sms.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "+15550001111");
    assert!(sent[0].1.contains("Maya"));

    // Further passes are no-ops.
    h.engine.run_pass(utc(2025, 6, 7, 11, 0)).await;
    h.engine.run_pass(utc(2025, 6, 8, 10, 0)).await;
    assert_eq!(h.sms.sent().len(), 1);
    assert_eq!(h.sent_audit_count(subject).await, 1);
}

#[tokio::test]
async fn countdown_without_anchor_date_never_fires() {
    let h = harness().await;
    create_countdown_sms(&h, 7).await;
    h.seed_subject(None, None).await;

    h.engine.run_pass(utc(2025, 6, 7, 12, 0)).await;
    assert!(h.store.list_due_items(utc(2026, 1, 1, 0, 0)).await.unwrap().is_empty());
    assert!(h.sms.sent().is_empty());
}

#[tokio::test]
async fn stale_countdown_is_not_backfilled() {
    let h = harness().await;
    h.store.set_send_hour(h.tenant, 10).await.unwrap();
    create_countdown_sms(&h, 7).await;
    let wedding = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
    h.seed_subject(None, Some(wedding)).await;

    // Five days past the fire date: outside the grace window, skipped.
    h.engine.run_pass(utc(2025, 6, 12, 12, 0)).await;
    assert!(h.sms.sent().is_empty());
    assert!(h.store.list_due_items(utc(2026, 1, 1, 0, 0)).await.unwrap().is_empty());
}

// ── Concurrent schedulers (spec scenario 4) ─────────────────────────

#[tokio::test]
async fn concurrent_passes_produce_one_success_record() {
    let h = harness().await;
    h.store.set_send_hour(h.tenant, 10).await.unwrap();
    create_countdown_sms(&h, 7).await;
    let wedding = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
    let subject = h.seed_subject(None, Some(wedding)).await;

    // Materialize the due item, then race two passes over it.
    h.engine.run_pass(utc(2025, 6, 7, 8, 0)).await;
    let now = utc(2025, 6, 7, 10, 5);
    tokio::join!(h.engine.run_pass(now), h.engine.run_pass(now));

    assert_eq!(h.sent_audit_count(subject).await, 1);
}

// ── Drip campaigns (spec scenario 3) ────────────────────────────────

#[tokio::test]
async fn drip_subscription_advances_only_after_successful_send() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let campaign = h
        .create_campaign_with_emails(
            stage,
            &[
                StepOffset::Days(0),
                StepOffset::Days(9),
                StepOffset::Days(14),
            ],
            EmailApproval::Approved,
        )
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let start = utc(2025, 1, 1, 10, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = start;
    h.engine.handle_event(&event).await;

    // Enrolled with the cursor at index 0, due immediately.
    let due = h.store.list_due_subscriptions(start).await.unwrap();
    assert_eq!(due.len(), 1);
    let subscription_id = due[0].id;
    assert_eq!(due[0].next_email_index, 0);

    // First send: cursor advances to index 1, due nine days in.
    h.engine.run_pass(utc(2025, 1, 1, 10, 1)).await;
    assert_eq!(h.email.sent().len(), 1);
    let sub = h.store.get_subscription(h.tenant, subscription_id).await.unwrap().unwrap();
    assert_eq!(sub.next_email_index, 1);
    assert_eq!(sub.next_email_at, Some(utc(2025, 1, 10, 10, 0)));
    assert_eq!(sub.status, SubscriptionStatus::Active);

    // Replaying the pass sends nothing new.
    h.engine.run_pass(utc(2025, 1, 1, 10, 1)).await;
    assert_eq!(h.email.sent().len(), 1);

    // Second and third sends, then completion.
    h.engine.run_pass(utc(2025, 1, 10, 10, 1)).await;
    h.engine.run_pass(utc(2025, 1, 24, 10, 1)).await;
    assert_eq!(h.email.sent().len(), 3);
    let sub = h.store.get_subscription(h.tenant, subscription_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Completed);
    assert_eq!(sub.next_email_index, 3);
    assert!(sub.next_email_at.is_none());

    // Audit rows reference the campaign, one per email index.
    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    let campaign_sends: Vec<_> = history
        .iter()
        .filter(|r| r.rule.id() == campaign.id && r.status == ExecutionStatus::Sent)
        .collect();
    assert_eq!(campaign_sends.len(), 3);
}

#[tokio::test]
async fn unapproved_email_holds_subscription_without_skipping() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let campaign = h
        .create_campaign_with_emails(
            stage,
            &[StepOffset::Days(0), StepOffset::Days(5)],
            EmailApproval::Pending,
        )
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let start = utc(2025, 2, 1, 10, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = start;
    h.engine.handle_event(&event).await;

    // Held: no send, cursor unmoved.
    let summary = h.engine.run_pass(utc(2025, 2, 1, 10, 1)).await;
    assert_eq!(summary.held, 1);
    assert!(h.email.sent().is_empty());

    let due = h.store.list_due_subscriptions(utc(2025, 2, 1, 10, 1)).await.unwrap();
    assert_eq!(due[0].next_email_index, 0);

    // Operator approves; the held email goes out.
    h.store
        .set_email_approval(campaign.id, 0, EmailApproval::Approved)
        .await
        .unwrap();
    let summary = h.engine.run_pass(utc(2025, 2, 1, 10, 2)).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(h.email.sent().len(), 1);
}

#[tokio::test]
async fn rejected_email_is_skipped_without_sending() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let campaign = h
        .create_campaign_with_emails(
            stage,
            &[StepOffset::Days(0), StepOffset::Days(5)],
            EmailApproval::Approved,
        )
        .await;
    h.store
        .set_email_approval(campaign.id, 0, EmailApproval::Rejected)
        .await
        .unwrap();
    let subject = h.seed_subject(Some(stage), None).await;

    let start = utc(2025, 2, 1, 10, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = start;
    h.engine.handle_event(&event).await;

    let summary = h.engine.run_pass(utc(2025, 2, 1, 10, 1)).await;
    assert_eq!(summary.skipped, 1);
    assert!(h.email.sent().is_empty());

    // Cursor advanced past the rejected email; the skip is in the history.
    let due = h.store.list_due_subscriptions(utc(2025, 2, 6, 10, 1)).await.unwrap();
    assert_eq!(due[0].next_email_index, 1);
    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    assert!(history.iter().any(|r| r.status == ExecutionStatus::Skipped));

    // The second (approved) email sends on schedule.
    h.engine.run_pass(utc(2025, 2, 6, 10, 1)).await;
    assert_eq!(h.email.sent().len(), 1);
    assert_eq!(h.email.sent()[0].subject, "Nurture #1");
}

#[tokio::test]
async fn failed_delivery_leaves_subscription_due_and_retries() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    h.create_campaign_with_emails(stage, &[StepOffset::Days(0)], EmailApproval::Approved)
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let start = utc(2025, 2, 1, 10, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = start;
    h.engine.handle_event(&event).await;

    // Provider down: failed attempt recorded, cursor unmoved.
    h.email.set_failing(true);
    let summary = h.engine.run_pass(utc(2025, 2, 1, 10, 1)).await;
    assert_eq!(summary.failed, 1);
    let due = h.store.list_due_subscriptions(utc(2025, 2, 1, 10, 2)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].next_email_index, 0);

    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    assert!(history.iter().any(|r| r.status == ExecutionStatus::Failed));

    // Next pass retries and succeeds.
    h.email.set_failing(false);
    let summary = h.engine.run_pass(utc(2025, 2, 1, 10, 3)).await;
    assert_eq!(summary.sent, 1);
    assert_eq!(h.sent_audit_count(subject).await, 1);
}

#[tokio::test]
async fn paused_and_unsubscribed_subscriptions_do_not_dispatch() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    h.create_campaign_with_emails(stage, &[StepOffset::Days(0)], EmailApproval::Approved)
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let start = utc(2025, 2, 1, 10, 0);
    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = start;
    h.engine.handle_event(&event).await;

    let due = h.store.list_due_subscriptions(start).await.unwrap();
    let subscription_id = due[0].id;

    h.engine
        .transition_subscription(h.tenant, subscription_id, SubscriptionStatus::Paused)
        .await
        .unwrap();
    h.engine.run_pass(utc(2025, 2, 1, 10, 1)).await;
    assert!(h.email.sent().is_empty());

    // Resume keeps the cursor; the pending email then sends.
    h.engine
        .transition_subscription(h.tenant, subscription_id, SubscriptionStatus::Active)
        .await
        .unwrap();
    h.engine
        .transition_subscription(h.tenant, subscription_id, SubscriptionStatus::Unsubscribed)
        .await
        .unwrap();
    h.engine.run_pass(utc(2025, 2, 1, 10, 2)).await;
    assert!(h.email.sent().is_empty());
}

// ── Business events and stage changes (spec scenario 5) ─────────────

#[tokio::test]
async fn business_event_mutates_stage_immediately() {
    let h = harness().await;
    let discovery_stage = Uuid::new_v4();
    let now = Utc::now();
    let automation = Automation {
        id: Uuid::new_v4(),
        tenant_id: h.tenant,
        name: "book discovery call".to_string(),
        scope: Scope::Global,
        project_type: None,
        channel: ChannelKind::StateChange,
        enabled: true,
        kind: AutomationKind::StageChange {
            target_stage: discovery_stage,
        },
        created_at: now,
        updated_at: now,
    };
    h.store.create_automation(&automation).await.unwrap();
    h.store
        .create_business_trigger(&BusinessTrigger {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            event_type: BusinessEventType::AppointmentBooked,
            source_stage: None,
        })
        .await
        .unwrap();

    let initial_stage = Uuid::new_v4();
    let subject = h.seed_subject(Some(initial_stage), None).await;

    let event = TriggerEvent::business_event(h.tenant, subject, BusinessEventType::AppointmentBooked);
    h.engine.handle_event(&event).await;

    // The subject moved and exactly one audit row exists; no delay
    // resolution was involved.
    let record = h.store.get_subject(h.tenant, subject).await.unwrap().unwrap();
    assert_eq!(record.stage_id, Some(discovery_stage));

    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].channel, ChannelKind::StateChange);
    assert_eq!(history[0].status, ExecutionStatus::Sent);
    assert!(h.store.list_due_items(Utc::now() + chrono::Duration::days(365)).await.unwrap().is_empty());
}

#[tokio::test]
async fn source_stage_constraint_filters_business_events() {
    let h = harness().await;
    let required_stage = Uuid::new_v4();
    let target_stage = Uuid::new_v4();
    let now = Utc::now();
    let automation = Automation {
        id: Uuid::new_v4(),
        tenant_id: h.tenant,
        name: "advance after signing".to_string(),
        scope: Scope::Global,
        project_type: None,
        channel: ChannelKind::StateChange,
        enabled: true,
        kind: AutomationKind::StageChange {
            target_stage,
        },
        created_at: now,
        updated_at: now,
    };
    h.store.create_automation(&automation).await.unwrap();
    h.store
        .create_business_trigger(&BusinessTrigger {
            id: Uuid::new_v4(),
            automation_id: automation.id,
            event_type: BusinessEventType::ProposalSigned,
            source_stage: Some(required_stage),
        })
        .await
        .unwrap();

    // Subject in a different stage: constraint fails, nothing happens.
    let elsewhere = h.seed_subject(Some(Uuid::new_v4()), None).await;
    let event = TriggerEvent::business_event(h.tenant, elsewhere, BusinessEventType::ProposalSigned);
    h.engine.handle_event(&event).await;
    let record = h.store.get_subject(h.tenant, elsewhere).await.unwrap().unwrap();
    assert_ne!(record.stage_id, Some(target_stage));

    // Subject in the required stage: fires.
    let in_stage = h.seed_subject(Some(required_stage), None).await;
    let event = TriggerEvent::business_event(h.tenant, in_stage, BusinessEventType::ProposalSigned);
    h.engine.handle_event(&event).await;
    let record = h.store.get_subject(h.tenant, in_stage).await.unwrap().unwrap();
    assert_eq!(record.stage_id, Some(target_stage));
}

// ── Disable semantics (spec property 5) ─────────────────────────────

#[tokio::test]
async fn disabling_stops_new_work_but_not_persisted_items() {
    let h = harness().await;
    let stage = Uuid::new_v4();
    let automation = h
        .create_email_automation(
            Scope::Stage(stage),
            DelaySpec {
                days: 1,
                ..Default::default()
            },
        )
        .await;
    let subject = h.seed_subject(Some(stage), None).await;

    let mut event = TriggerEvent::stage_entered(h.tenant, subject, stage, Some("wedding".into()));
    event.occurred_at = utc(2025, 3, 1, 9, 0);
    h.engine.handle_event(&event).await;
    assert_eq!(h.store.list_due_items(utc(2025, 3, 5, 0, 0)).await.unwrap().len(), 1);

    h.store
        .set_automation_enabled(h.tenant, automation.id, false)
        .await
        .unwrap();

    // A new event creates no new due-item.
    let other = h.seed_subject(Some(stage), None).await;
    let mut event = TriggerEvent::stage_entered(h.tenant, other, stage, Some("wedding".into()));
    event.occurred_at = utc(2025, 3, 1, 12, 0);
    h.engine.handle_event(&event).await;
    assert_eq!(h.store.list_due_items(utc(2025, 3, 5, 0, 0)).await.unwrap().len(), 1);

    // The persisted item still fires, flagged as an anomaly.
    let summary = h.engine.run_pass(utc(2025, 3, 2, 9, 30)).await;
    assert_eq!(summary.sent, 1);
    let history = h.store.list_subject_history(h.tenant, subject, 10).await.unwrap();
    assert_eq!(history[0].anomaly.as_deref(), Some("disabled-after-fire"));
}
