//! Operator-facing REST surface.
//!
//! A thin layer over the engine and store: create/enable/disable
//! automations, manage campaigns and per-email approvals, control
//! subscriptions, and read a subject's automation history. Inputs arrive
//! pre-validated and tenant-scoped; no business logic lives here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::automation::model::{
    Automation, AutomationKind, AutomationStep, BusinessEventType, BusinessTrigger, Content,
    DelaySpec, Scope,
};
use crate::campaign::model::{
    CampaignStatus, DripCampaign, DripCampaignEmail, EmailApproval, StepOffset,
};
use crate::campaign::subscription::SubscriptionStatus;
use crate::channels::ChannelKind;
use crate::engine::Engine;
use crate::error::{DatabaseError, Error};
use crate::store::{Store, SubjectRecord};
use crate::trigger::TriggerEvent;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn Store>,
}

/// Build the Axum router for the operator API.
pub fn api_routes(engine: Arc<Engine>, store: Arc<dyn Store>) -> Router {
    let state = AppState { engine, store };

    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(ingest_event))
        .route("/api/automations", get(list_automations).post(create_automation))
        .route("/api/automations/{id}/enable", post(enable_automation))
        .route("/api/automations/{id}/disable", post(disable_automation))
        .route("/api/automations/{id}/steps", post(add_step))
        .route("/api/automations/{id}/triggers", post(add_business_trigger))
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/campaigns/{id}/status", post(set_campaign_status))
        .route("/api/campaigns/{id}/emails", post(add_campaign_email))
        .route(
            "/api/campaigns/{id}/emails/{index}/approval",
            post(set_email_approval),
        )
        .route("/api/subscriptions", post(enroll_subscription))
        .route("/api/subscriptions/{id}/status", post(set_subscription_status))
        .route("/api/templates", post(create_template))
        .route("/api/subjects", put(upsert_subject))
        .route("/api/subjects/{id}/history", get(subject_history))
        .route("/api/tenants/{id}/send-hour", put(set_send_hour))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
        Error::Rule(crate::error::RuleError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Error::Rule(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "studioflow",
    }))
}

// ── Events ──────────────────────────────────────────────────────────

/// The CRM glue posts stage changes and business events here. Fire and
/// forget: automation side effects are never reported back synchronously.
async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> impl IntoResponse {
    state.engine.handle_event(&event).await;
    StatusCode::ACCEPTED
}

// ── Automations ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: Uuid,
}

async fn list_automations(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    match state.store.list_automations(query.tenant_id).await {
        Ok(automations) => (StatusCode::OK, Json(serde_json::json!(automations))),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateAutomationRequest {
    tenant_id: Uuid,
    name: String,
    /// Absent means global scope.
    stage_id: Option<Uuid>,
    project_type: Option<String>,
    channel: ChannelKind,
    kind: AutomationKind,
}

async fn create_automation(
    State(state): State<AppState>,
    Json(req): Json<CreateAutomationRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let id = Uuid::new_v4();

    // Round-trip through the DB representation so kind invariants (target
    // stage present, delay non-negative, clock times in range) are checked
    // here instead of surfacing later as skipped rules.
    if let Err(e) = AutomationKind::from_db(id, req.kind.type_tag(), req.kind.to_config_json()) {
        return error_response(e.into());
    }

    let automation = Automation {
        id,
        tenant_id: req.tenant_id,
        name: req.name,
        scope: match req.stage_id {
            Some(stage) => Scope::Stage(stage),
            None => Scope::Global,
        },
        project_type: req.project_type,
        channel: req.channel,
        enabled: true,
        kind: req.kind,
        created_at: now,
        updated_at: now,
    };

    match state.store.create_automation(&automation).await {
        Ok(()) => {
            info!(automation = %automation.name, "Automation created");
            (StatusCode::CREATED, Json(serde_json::json!(automation)))
        }
        Err(e) => error_response(e.into()),
    }
}

async fn enable_automation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TenantQuery>,
) -> impl IntoResponse {
    match state
        .store
        .set_automation_enabled(req.tenant_id, id, true)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

async fn disable_automation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TenantQuery>,
) -> impl IntoResponse {
    match state
        .store
        .set_automation_enabled(req.tenant_id, id, false)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AddStepRequest {
    step_index: u32,
    channel: ChannelKind,
    content: Content,
    #[serde(default)]
    delay: DelaySpec,
}

async fn add_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddStepRequest>,
) -> impl IntoResponse {
    let step = AutomationStep {
        id: Uuid::new_v4(),
        automation_id: id,
        step_index: req.step_index,
        channel: req.channel,
        content: req.content,
        delay: req.delay,
    };
    if let Err(e) = step.validate() {
        return error_response(e.into()).into_response();
    }

    match state.store.create_automation_step(&step).await {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!(step))).into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AddTriggerRequest {
    event_type: BusinessEventType,
    source_stage: Option<Uuid>,
}

async fn add_business_trigger(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddTriggerRequest>,
) -> impl IntoResponse {
    let trigger = BusinessTrigger {
        id: Uuid::new_v4(),
        automation_id: id,
        event_type: req.event_type,
        source_stage: req.source_stage,
    };

    match state.store.create_business_trigger(&trigger).await {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!(trigger))).into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

// ── Campaigns ───────────────────────────────────────────────────────

async fn list_campaigns(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    match state.store.list_campaigns(query.tenant_id).await {
        Ok(campaigns) => (StatusCode::OK, Json(serde_json::json!(campaigns))),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateCampaignRequest {
    tenant_id: Uuid,
    name: String,
    target_stage: Uuid,
    project_type: String,
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> impl IntoResponse {
    let now = Utc::now();
    let campaign = DripCampaign {
        id: Uuid::new_v4(),
        tenant_id: req.tenant_id,
        name: req.name,
        target_stage: req.target_stage,
        project_type: req.project_type,
        status: CampaignStatus::Draft,
        created_at: now,
        updated_at: now,
    };

    match state.store.create_campaign(&campaign).await {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!(campaign))),
        Err(e) => error_response(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct CampaignStatusRequest {
    tenant_id: Uuid,
    status: CampaignStatus,
}

async fn set_campaign_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CampaignStatusRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .transition_campaign(req.tenant_id, id, req.status)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AddEmailRequest {
    email_index: u32,
    subject: String,
    body: String,
    offset: StepOffset,
}

async fn add_campaign_email(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddEmailRequest>,
) -> impl IntoResponse {
    let email = DripCampaignEmail {
        id: Uuid::new_v4(),
        campaign_id: id,
        email_index: req.email_index,
        subject: req.subject,
        body: req.body,
        offset: req.offset,
        approval: EmailApproval::Pending,
    };

    match state.store.create_campaign_email(&email).await {
        Ok(()) => (StatusCode::CREATED, Json(serde_json::json!(email))).into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalRequest {
    approval: EmailApproval,
}

async fn set_email_approval(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, u32)>,
    Json(req): Json<ApprovalRequest>,
) -> impl IntoResponse {
    match state.store.set_email_approval(id, index, req.approval).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

// ── Subscriptions ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    tenant_id: Uuid,
    campaign_id: Uuid,
    project_id: Uuid,
}

async fn enroll_subscription(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .enroll(req.tenant_id, req.campaign_id, req.project_id)
        .await
    {
        Ok(Some(subscription)) => {
            (StatusCode::CREATED, Json(serde_json::json!(subscription))).into_response()
        }
        Ok(None) => StatusCode::CONFLICT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionStatusRequest {
    tenant_id: Uuid,
    status: SubscriptionStatus,
}

async fn set_subscription_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubscriptionStatusRequest>,
) -> impl IntoResponse {
    match state
        .engine
        .transition_subscription(req.tenant_id, id, req.status)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// ── Templates ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTemplateRequest {
    tenant_id: Uuid,
    name: String,
    subject: Option<String>,
    body: String,
}

async fn create_template(
    State(state): State<AppState>,
    Json(req): Json<CreateTemplateRequest>,
) -> impl IntoResponse {
    let template = crate::store::MessageTemplate {
        id: Uuid::new_v4(),
        tenant_id: req.tenant_id,
        name: req.name,
        subject: req.subject,
        body: req.body,
        created_at: Utc::now(),
    };

    match state.store.create_template(&template).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "id": template.id })),
        )
            .into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

// ── Subjects ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpsertSubjectRequest {
    id: Uuid,
    tenant_id: Uuid,
    first_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    stage_id: Option<Uuid>,
    project_type: Option<String>,
    wedding_date: Option<chrono::NaiveDate>,
    session_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    fields: std::collections::HashMap<String, String>,
}

async fn upsert_subject(
    State(state): State<AppState>,
    Json(req): Json<UpsertSubjectRequest>,
) -> impl IntoResponse {
    let subject = SubjectRecord {
        id: req.id,
        tenant_id: req.tenant_id,
        first_name: req.first_name,
        email: req.email,
        phone: req.phone,
        stage_id: req.stage_id,
        project_type: req.project_type,
        wedding_date: req.wedding_date,
        session_date: req.session_date,
        fields: req.fields,
    };

    match state.store.upsert_subject(&subject).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    tenant_id: Uuid,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn subject_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state
        .store
        .list_subject_history(query.tenant_id, id, query.limit)
        .await
    {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))),
        Err(e) => error_response(e.into()),
    }
}

// ── Tenant settings ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendHourRequest {
    hour: u32,
}

async fn set_send_hour(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendHourRequest>,
) -> impl IntoResponse {
    if req.hour > 23 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "hour must be 0-23" })),
        )
            .into_response();
    }

    match state.store.set_send_hour(id, req.hour).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e.into()).into_response(),
    }
}
