//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Kind-specific automation
//! parameters round-trip through a JSON config column; rows that fail to
//! parse are skipped with a warning in list methods so one bad rule never
//! poisons a batch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::automation::model::{
    Automation, AutomationKind, AutomationStep, BusinessEventType, BusinessTrigger, Scope,
};
use crate::campaign::model::{
    CampaignStatus, DripCampaign, DripCampaignEmail, EmailApproval, StepOffset,
};
use crate::campaign::subscription::{Subscription, SubscriptionStatus};
use crate::channels::ChannelKind;
use crate::dispatch::model::{DueItem, ExecutionRecord, ExecutionStatus, RuleRef};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{MessageTemplate, Store, SubjectRecord};

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("bad {what} uuid '{s}': {e}")))
}

fn opt_text(value: &Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.clone()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(value: &Option<DateTime<Utc>>) -> libsql::Value {
    match value {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_date(value: &Option<NaiveDate>) -> libsql::Value {
    match value {
        Some(d) => libsql::Value::Text(d.format("%Y-%m-%d").to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(value: Option<i64>) -> libsql::Value {
    match value {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const AUTOMATION_COLUMNS: &str =
    "id, tenant_id, name, stage_id, project_type, channel, enabled, kind_type, kind_config, \
     created_at, updated_at";

fn row_to_automation(row: &libsql::Row) -> Result<Automation, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let id = parse_uuid(&id_str, "automation")?;

    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let name: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let stage_str: Option<String> = row.get::<String>(3).ok();
    let project_type: Option<String> = row.get::<String>(4).ok();
    let channel_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let enabled: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let kind_type: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let kind_config_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let created_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let updated_str: String = row
        .get(10)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let scope = match stage_str {
        Some(s) => Scope::Stage(parse_uuid(&s, "automation stage")?),
        None => Scope::Global,
    };
    let channel: ChannelKind = channel_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let kind_config: serde_json::Value = serde_json::from_str(&kind_config_str)
        .map_err(|e| DatabaseError::Serialization(format!("kind_config: {e}")))?;
    let kind = AutomationKind::from_db(id, &kind_type, kind_config)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(Automation {
        id,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        name,
        scope,
        project_type,
        channel,
        enabled: enabled != 0,
        kind,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const STEP_COLUMNS: &str = "id, automation_id, step_index, channel, content, delay";

fn row_to_step(row: &libsql::Row) -> Result<AutomationStep, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let automation_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let step_index: i64 = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let channel_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let content_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let delay_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(AutomationStep {
        id: parse_uuid(&id_str, "step")?,
        automation_id: parse_uuid(&automation_str, "step automation")?,
        step_index: step_index as u32,
        channel: channel_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        content: serde_json::from_str(&content_str)
            .map_err(|e| DatabaseError::Serialization(format!("step content: {e}")))?,
        delay: serde_json::from_str(&delay_str)
            .map_err(|e| DatabaseError::Serialization(format!("step delay: {e}")))?,
    })
}

const CAMPAIGN_COLUMNS: &str =
    "id, tenant_id, name, target_stage, project_type, status, created_at, updated_at";

fn row_to_campaign(row: &libsql::Row) -> Result<DripCampaign, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let name: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let stage_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let project_type: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let status_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let created_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let updated_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(DripCampaign {
        id: parse_uuid(&id_str, "campaign")?,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        name,
        target_stage: parse_uuid(&stage_str, "campaign stage")?,
        project_type,
        status: status_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const EMAIL_COLUMNS: &str =
    "id, campaign_id, email_index, subject, body, offset_unit, offset_value, approval";

fn row_to_email(row: &libsql::Row) -> Result<DripCampaignEmail, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let campaign_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let email_index: i64 = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let subject: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let body: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let offset_unit: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let offset_value: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let approval_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let offset = match offset_unit.as_str() {
        "days" => StepOffset::Days(offset_value),
        "weeks" => StepOffset::Weeks(offset_value),
        other => {
            return Err(DatabaseError::Serialization(format!(
                "unknown offset unit: {other}"
            )));
        }
    };

    Ok(DripCampaignEmail {
        id: parse_uuid(&id_str, "campaign email")?,
        campaign_id: parse_uuid(&campaign_str, "campaign")?,
        email_index: email_index as u32,
        subject,
        body,
        offset,
        approval: approval_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
    })
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, tenant_id, campaign_id, project_id, status, started_at, next_email_index, \
     next_email_at, created_at, updated_at";

fn row_to_subscription(row: &libsql::Row) -> Result<Subscription, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let campaign_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let project_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let started_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let next_index: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let next_at_str: Option<String> = row.get::<String>(7).ok();
    let created_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let updated_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(Subscription {
        id: parse_uuid(&id_str, "subscription")?,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        campaign_id: parse_uuid(&campaign_str, "campaign")?,
        project_id: parse_uuid(&project_str, "project")?,
        status: status_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        started_at: parse_datetime(&started_str),
        next_email_index: next_index as u32,
        next_email_at: next_at_str.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const DUE_ITEM_COLUMNS: &str =
    "id, tenant_id, automation_id, step_index, subject_id, channel, content, occurrence_key, \
     fire_at, created_at";

fn row_to_due_item(row: &libsql::Row) -> Result<DueItem, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let automation_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let step_index: Option<i64> = row.get::<i64>(3).ok();
    let subject_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let channel_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let content_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let occurrence_key: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let fire_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let created_str: String = row
        .get(9)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(DueItem {
        id: parse_uuid(&id_str, "due item")?,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        automation_id: parse_uuid(&automation_str, "automation")?,
        step_index: step_index.map(|i| i as u32),
        subject_id: parse_uuid(&subject_str, "subject")?,
        channel: channel_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        content: serde_json::from_str(&content_str)
            .map_err(|e| DatabaseError::Serialization(format!("due item content: {e}")))?,
        occurrence_key,
        fire_at: parse_datetime(&fire_str),
        created_at: parse_datetime(&created_str),
    })
}

const EXECUTION_COLUMNS: &str =
    "id, tenant_id, rule_kind, rule_id, subject_id, occurrence_key, channel, status, detail, \
     provider_message_id, anomaly, executed_at";

fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let rule_kind: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let rule_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let subject_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let occurrence_key: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let channel_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let status_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let detail: Option<String> = row.get::<String>(8).ok();
    let provider_message_id: Option<String> = row.get::<String>(9).ok();
    let anomaly: Option<String> = row.get::<String>(10).ok();
    let executed_str: String = row
        .get(11)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    let rule_id = parse_uuid(&rule_str, "rule")?;
    let rule = match rule_kind.as_str() {
        "automation" => RuleRef::Automation(rule_id),
        "campaign" => RuleRef::Campaign(rule_id),
        other => {
            return Err(DatabaseError::Serialization(format!(
                "unknown rule kind: {other}"
            )));
        }
    };

    Ok(ExecutionRecord {
        id: parse_uuid(&id_str, "execution")?,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        rule,
        subject_id: parse_uuid(&subject_str, "subject")?,
        occurrence_key,
        channel: channel_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        status: status_str
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        detail,
        provider_message_id,
        anomaly,
        executed_at: parse_datetime(&executed_str),
    })
}

const SUBJECT_COLUMNS: &str =
    "id, tenant_id, first_name, email, phone, stage_id, project_type, wedding_date, \
     session_date, fields";

fn row_to_subject(row: &libsql::Row) -> Result<SubjectRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tenant_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let first_name: Option<String> = row.get::<String>(2).ok();
    let email: Option<String> = row.get::<String>(3).ok();
    let phone: Option<String> = row.get::<String>(4).ok();
    let stage_str: Option<String> = row.get::<String>(5).ok();
    let project_type: Option<String> = row.get::<String>(6).ok();
    let wedding_str: Option<String> = row.get::<String>(7).ok();
    let session_str: Option<String> = row.get::<String>(8).ok();
    let fields_str: String = row.get::<String>(9).unwrap_or_else(|_| "{}".into());

    let stage_id = match stage_str {
        Some(s) => Some(parse_uuid(&s, "subject stage")?),
        None => None,
    };
    let fields: HashMap<String, String> = serde_json::from_str(&fields_str).unwrap_or_default();

    Ok(SubjectRecord {
        id: parse_uuid(&id_str, "subject")?,
        tenant_id: parse_uuid(&tenant_str, "tenant")?,
        first_name,
        email,
        phone,
        stage_id,
        project_type,
        wedding_date: wedding_str.as_deref().and_then(parse_date),
        session_date: session_str.as_deref().and_then(parse_date),
        fields,
    })
}

// ── Store impl ──────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Automations ─────────────────────────────────────────────────

    async fn create_automation(&self, automation: &Automation) -> Result<(), DatabaseError> {
        let kind_config = serde_json::to_string(&automation.kind.to_config_json())
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO automations (id, tenant_id, name, stage_id, project_type, channel, \
                 enabled, kind_type, kind_config, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    automation.id.to_string(),
                    automation.tenant_id.to_string(),
                    automation.name.clone(),
                    opt_text(&automation.scope.stage_id().map(|s| s.to_string())),
                    opt_text(&automation.project_type),
                    automation.channel.to_string(),
                    automation.enabled as i64,
                    automation.kind.type_tag(),
                    kind_config,
                    automation.created_at.to_rfc3339(),
                    automation.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_automation: {e}")))?;
        Ok(())
    }

    async fn update_automation(&self, automation: &Automation) -> Result<(), DatabaseError> {
        let kind_config = serde_json::to_string(&automation.kind.to_config_json())
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "UPDATE automations SET name = ?3, stage_id = ?4, project_type = ?5, \
                 channel = ?6, enabled = ?7, kind_type = ?8, kind_config = ?9, updated_at = ?10 \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![
                    automation.tenant_id.to_string(),
                    automation.id.to_string(),
                    automation.name.clone(),
                    opt_text(&automation.scope.stage_id().map(|s| s.to_string())),
                    opt_text(&automation.project_type),
                    automation.channel.to_string(),
                    automation.enabled as i64,
                    automation.kind.type_tag(),
                    kind_config,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_automation: {e}")))?;
        Ok(())
    }

    async fn get_automation(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Automation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations \
                     WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_automation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_automation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_automation: {e}"))),
        }
    }

    async fn list_automations(&self, tenant_id: Uuid) -> Result<Vec<Automation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations \
                     WHERE tenant_id = ?1 ORDER BY name"
                ),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_automations: {e}")))?;

        let mut automations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_automation(&row) {
                Ok(a) => automations.push(a),
                Err(e) => warn!("Skipping malformed automation row: {e}"),
            }
        }
        Ok(automations)
    }

    async fn list_enabled_automations(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<Automation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations \
                     WHERE tenant_id = ?1 AND enabled = 1 ORDER BY name"
                ),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_enabled_automations: {e}")))?;

        let mut automations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_automation(&row) {
                Ok(a) => automations.push(a),
                Err(e) => warn!("Skipping malformed automation row: {e}"),
            }
        }
        Ok(automations)
    }

    async fn list_enabled_countdowns(&self) -> Result<Vec<Automation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUTOMATION_COLUMNS} FROM automations \
                     WHERE enabled = 1 AND kind_type = 'countdown'"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_enabled_countdowns: {e}")))?;

        let mut automations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_automation(&row) {
                Ok(a) => automations.push(a),
                Err(e) => warn!("Skipping malformed countdown row: {e}"),
            }
        }
        Ok(automations)
    }

    async fn set_automation_enabled(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        enabled: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE automations SET enabled = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![
                    tenant_id.to_string(),
                    id.to_string(),
                    enabled as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_automation_enabled: {e}")))?;
        Ok(())
    }

    async fn create_automation_step(&self, step: &AutomationStep) -> Result<(), DatabaseError> {
        let content = serde_json::to_string(&step.content)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let delay = serde_json::to_string(&step.delay)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO automation_steps (id, automation_id, step_index, channel, content, \
                 delay) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    step.id.to_string(),
                    step.automation_id.to_string(),
                    step.step_index as i64,
                    step.channel.to_string(),
                    content,
                    delay,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_automation_step: {e}")))?;
        Ok(())
    }

    async fn list_automation_steps(
        &self,
        automation_id: Uuid,
    ) -> Result<Vec<AutomationStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM automation_steps \
                     WHERE automation_id = ?1 ORDER BY step_index"
                ),
                params![automation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_automation_steps: {e}")))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_step(&row) {
                Ok(s) => steps.push(s),
                Err(e) => warn!("Skipping malformed step row: {e}"),
            }
        }
        Ok(steps)
    }

    async fn create_business_trigger(
        &self,
        trigger: &BusinessTrigger,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO business_triggers (id, automation_id, event_type, \
                 source_stage) VALUES (?1, ?2, ?3, ?4)",
                params![
                    trigger.id.to_string(),
                    trigger.automation_id.to_string(),
                    trigger.event_type.to_string(),
                    opt_text(&trigger.source_stage.map(|s| s.to_string())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_business_trigger: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::Constraint(format!(
                "automation {} already has a {} trigger",
                trigger.automation_id, trigger.event_type
            )));
        }
        Ok(())
    }

    async fn list_business_triggers(
        &self,
        tenant_id: Uuid,
        event_type: BusinessEventType,
    ) -> Result<Vec<BusinessTrigger>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT bt.id, bt.automation_id, bt.event_type, bt.source_stage \
                 FROM business_triggers bt \
                 JOIN automations a ON a.id = bt.automation_id \
                 WHERE a.tenant_id = ?1 AND bt.event_type = ?2",
                params![tenant_id.to_string(), event_type.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_business_triggers: {e}")))?;

        let mut triggers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = match row.get(0) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping malformed trigger row: {e}");
                    continue;
                }
            };
            let automation_str: String = match row.get(1) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping malformed trigger row: {e}");
                    continue;
                }
            };
            let event_str: String = match row.get(2) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping malformed trigger row: {e}");
                    continue;
                }
            };
            let source_str: Option<String> = row.get::<String>(3).ok();

            let parsed = (
                Uuid::parse_str(&id_str),
                Uuid::parse_str(&automation_str),
                event_str.parse::<BusinessEventType>(),
                source_str.map(|s| Uuid::parse_str(&s)).transpose(),
            );
            match parsed {
                (Ok(id), Ok(automation_id), Ok(event_type), Ok(source_stage)) => {
                    triggers.push(BusinessTrigger {
                        id,
                        automation_id,
                        event_type,
                        source_stage,
                    });
                }
                _ => warn!("Skipping malformed trigger row: {id_str}"),
            }
        }
        Ok(triggers)
    }

    async fn list_triggered_automation_ids(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT bt.automation_id FROM business_triggers bt \
                 JOIN automations a ON a.id = bt.automation_id WHERE a.tenant_id = ?1",
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_triggered_automation_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id_str) = row.get::<String>(0)
                && let Ok(id) = Uuid::parse_str(&id_str)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    // ── Drip campaigns ──────────────────────────────────────────────

    async fn create_campaign(&self, campaign: &DripCampaign) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO drip_campaigns (id, tenant_id, name, target_stage, project_type, \
                 status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    campaign.id.to_string(),
                    campaign.tenant_id.to_string(),
                    campaign.name.clone(),
                    campaign.target_stage.to_string(),
                    campaign.project_type.clone(),
                    campaign.status.to_string(),
                    campaign.created_at.to_rfc3339(),
                    campaign.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_campaign: {e}")))?;
        Ok(())
    }

    async fn get_campaign(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<DripCampaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM drip_campaigns \
                     WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_campaign(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        }
    }

    async fn list_campaigns(&self, tenant_id: Uuid) -> Result<Vec<DripCampaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM drip_campaigns \
                     WHERE tenant_id = ?1 AND status != 'deleted' ORDER BY name"
                ),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_campaign(&row) {
                Ok(c) => campaigns.push(c),
                Err(e) => warn!("Skipping malformed campaign row: {e}"),
            }
        }
        Ok(campaigns)
    }

    async fn set_campaign_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drip_campaigns SET status = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![
                    tenant_id.to_string(),
                    id.to_string(),
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_campaign_status: {e}")))?;
        Ok(())
    }

    async fn list_active_campaigns_for_stage(
        &self,
        tenant_id: Uuid,
        stage_id: Uuid,
    ) -> Result<Vec<DripCampaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM drip_campaigns \
                     WHERE tenant_id = ?1 AND target_stage = ?2 AND status = 'active'"
                ),
                params![tenant_id.to_string(), stage_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_campaigns_for_stage: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_campaign(&row) {
                Ok(c) => campaigns.push(c),
                Err(e) => warn!("Skipping malformed campaign row: {e}"),
            }
        }
        Ok(campaigns)
    }

    async fn create_campaign_email(
        &self,
        email: &DripCampaignEmail,
    ) -> Result<(), DatabaseError> {
        let (offset_unit, offset_value) = match email.offset {
            StepOffset::Days(d) => ("days", d),
            StepOffset::Weeks(w) => ("weeks", w),
        };

        self.conn()
            .execute(
                "INSERT INTO drip_campaign_emails (id, campaign_id, email_index, subject, body, \
                 offset_unit, offset_value, approval) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    email.id.to_string(),
                    email.campaign_id.to_string(),
                    email.email_index as i64,
                    email.subject.clone(),
                    email.body.clone(),
                    offset_unit,
                    offset_value,
                    email.approval.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_campaign_email: {e}")))?;
        Ok(())
    }

    async fn list_campaign_emails(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<DripCampaignEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM drip_campaign_emails \
                     WHERE campaign_id = ?1 ORDER BY email_index"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaign_emails: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_email(&row) {
                Ok(e) => emails.push(e),
                Err(e) => warn!("Skipping malformed campaign email row: {e}"),
            }
        }
        Ok(emails)
    }

    async fn set_email_approval(
        &self,
        campaign_id: Uuid,
        email_index: u32,
        approval: EmailApproval,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drip_campaign_emails SET approval = ?3 \
                 WHERE campaign_id = ?1 AND email_index = ?2",
                params![
                    campaign_id.to_string(),
                    email_index as i64,
                    approval.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_email_approval: {e}")))?;
        Ok(())
    }

    // ── Subscription ledger ─────────────────────────────────────────

    async fn create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO drip_subscriptions (id, tenant_id, campaign_id, \
                 project_id, status, started_at, next_email_index, next_email_at, created_at, \
                 updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    subscription.id.to_string(),
                    subscription.tenant_id.to_string(),
                    subscription.campaign_id.to_string(),
                    subscription.project_id.to_string(),
                    subscription.status.to_string(),
                    subscription.started_at.to_rfc3339(),
                    subscription.next_email_index as i64,
                    opt_datetime(&subscription.next_email_at),
                    subscription.created_at.to_rfc3339(),
                    subscription.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_subscription: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Subscription>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM drip_subscriptions \
                     WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subscription: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subscription(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subscription: {e}"))),
        }
    }

    async fn list_due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM drip_subscriptions \
                     WHERE status = 'active' AND next_email_at IS NOT NULL \
                     AND next_email_at <= ?1 ORDER BY next_email_at"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_subscriptions: {e}")))?;

        let mut subscriptions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_subscription(&row) {
                Ok(s) => subscriptions.push(s),
                Err(e) => warn!("Skipping malformed subscription row: {e}"),
            }
        }
        Ok(subscriptions)
    }

    async fn advance_subscription(
        &self,
        id: Uuid,
        next_email_index: u32,
        next_email_at: Option<DateTime<Utc>>,
        status: SubscriptionStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drip_subscriptions SET next_email_index = ?2, next_email_at = ?3, \
                 status = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    id.to_string(),
                    next_email_index as i64,
                    opt_datetime(&next_email_at),
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_subscription: {e}")))?;
        Ok(())
    }

    async fn set_subscription_status(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE drip_subscriptions SET status = ?3, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![
                    tenant_id.to_string(),
                    id.to_string(),
                    status.to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_subscription_status: {e}")))?;
        Ok(())
    }

    // ── Due-items ───────────────────────────────────────────────────

    async fn upsert_due_item(&self, item: &DueItem) -> Result<bool, DatabaseError> {
        let content = serde_json::to_string(&item.content)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO due_items (id, tenant_id, automation_id, step_index, \
                 subject_id, channel, content, occurrence_key, fire_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    item.id.to_string(),
                    item.tenant_id.to_string(),
                    item.automation_id.to_string(),
                    opt_int(item.step_index.map(|i| i as i64)),
                    item.subject_id.to_string(),
                    item.channel.to_string(),
                    content,
                    item.occurrence_key.clone(),
                    item.fire_at.to_rfc3339(),
                    item.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_due_item: {e}")))?;
        Ok(changed > 0)
    }

    async fn list_due_items(&self, now: DateTime<Utc>) -> Result<Vec<DueItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DUE_ITEM_COLUMNS} FROM due_items \
                     WHERE fire_at <= ?1 ORDER BY fire_at"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_items: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_due_item(&row) {
                Ok(i) => items.push(i),
                Err(e) => warn!("Skipping malformed due item row: {e}"),
            }
        }
        Ok(items)
    }

    async fn delete_due_item(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM due_items WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_due_item: {e}")))?;
        Ok(())
    }

    // ── Execution log ───────────────────────────────────────────────

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<bool, DatabaseError> {
        // INSERT OR IGNORE against the partial unique success index is the
        // atomic conditional claim: when two scheduler instances race on the
        // same due item, exactly one insert reports a changed row.
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO executions (id, tenant_id, rule_kind, rule_id, \
                 subject_id, occurrence_key, channel, status, detail, provider_message_id, \
                 anomaly, executed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    record.id.to_string(),
                    record.tenant_id.to_string(),
                    record.rule.kind_tag(),
                    record.rule.id().to_string(),
                    record.subject_id.to_string(),
                    record.occurrence_key.clone(),
                    record.channel.to_string(),
                    record.status.to_string(),
                    opt_text(&record.detail),
                    opt_text(&record.provider_message_id),
                    opt_text(&record.anomaly),
                    record.executed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_execution: {e}")))?;
        Ok(changed > 0)
    }

    async fn has_successful_execution(
        &self,
        rule: &RuleRef,
        subject_id: Uuid,
        occurrence_key: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM executions WHERE rule_kind = ?1 AND rule_id = ?2 \
                 AND subject_id = ?3 AND occurrence_key = ?4 AND status = ?5",
                params![
                    rule.kind_tag(),
                    rule.id().to_string(),
                    subject_id.to_string(),
                    occurrence_key,
                    ExecutionStatus::Sent.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_successful_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!(
                "has_successful_execution: {e}"
            ))),
        }
    }

    async fn list_subject_history(
        &self,
        tenant_id: Uuid,
        subject_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions \
                     WHERE tenant_id = ?1 AND subject_id = ?2 \
                     ORDER BY executed_at DESC LIMIT ?3"
                ),
                params![
                    tenant_id.to_string(),
                    subject_id.to_string(),
                    limit as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_subject_history: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_execution(&row) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping malformed execution row: {e}"),
            }
        }
        Ok(records)
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn create_template(&self, template: &MessageTemplate) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO templates (id, tenant_id, name, subject, body, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    template.id.to_string(),
                    template.tenant_id.to_string(),
                    template.name.clone(),
                    opt_text(&template.subject),
                    template.body.clone(),
                    template.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_template: {e}")))?;
        Ok(())
    }

    async fn get_template(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<MessageTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, name, subject, body, created_at FROM templates \
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_template: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                let tenant_str: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                let name: String = row
                    .get(2)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                let subject: Option<String> = row.get::<String>(3).ok();
                let body: String = row
                    .get(4)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                let created_str: String = row
                    .get(5)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

                Ok(Some(MessageTemplate {
                    id: parse_uuid(&id_str, "template")?,
                    tenant_id: parse_uuid(&tenant_str, "tenant")?,
                    name,
                    subject,
                    body,
                    created_at: parse_datetime(&created_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_template: {e}"))),
        }
    }

    // ── Tenant settings ─────────────────────────────────────────────

    async fn send_hour(&self, tenant_id: Uuid) -> Result<Option<u32>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT send_hour FROM tenant_settings WHERE tenant_id = ?1",
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("send_hour: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let hour: i64 = row.get(0).unwrap_or(0);
                Ok(Some(hour as u32))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("send_hour: {e}"))),
        }
    }

    async fn set_send_hour(&self, tenant_id: Uuid, hour: u32) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tenant_settings (tenant_id, send_hour, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tenant_id) DO UPDATE SET send_hour = excluded.send_hour, \
                 updated_at = excluded.updated_at",
                params![
                    tenant_id.to_string(),
                    hour as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_send_hour: {e}")))?;
        Ok(())
    }

    // ── Subjects ────────────────────────────────────────────────────

    async fn upsert_subject(&self, subject: &SubjectRecord) -> Result<(), DatabaseError> {
        let fields = serde_json::to_string(&subject.fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                "INSERT INTO subjects (id, tenant_id, first_name, email, phone, stage_id, \
                 project_type, wedding_date, session_date, fields, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(id) DO UPDATE SET first_name = excluded.first_name, \
                 email = excluded.email, phone = excluded.phone, stage_id = excluded.stage_id, \
                 project_type = excluded.project_type, wedding_date = excluded.wedding_date, \
                 session_date = excluded.session_date, fields = excluded.fields, \
                 updated_at = excluded.updated_at",
                params![
                    subject.id.to_string(),
                    subject.tenant_id.to_string(),
                    opt_text(&subject.first_name),
                    opt_text(&subject.email),
                    opt_text(&subject.phone),
                    opt_text(&subject.stage_id.map(|s| s.to_string())),
                    opt_text(&subject.project_type),
                    opt_date(&subject.wedding_date),
                    opt_date(&subject.session_date),
                    fields,
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_subject: {e}")))?;
        Ok(())
    }

    async fn get_subject(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<SubjectRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subject: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subject(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subject: {e}"))),
        }
    }

    async fn list_subjects_with_event_between(
        &self,
        tenant_id: Uuid,
        anchor: crate::automation::model::AnchorEvent,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<(Uuid, NaiveDate)>, DatabaseError> {
        use crate::automation::model::AnchorEvent;
        let column = match anchor {
            AnchorEvent::WeddingDate => "wedding_date",
            AnchorEvent::SessionDate => "session_date",
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id, {column} FROM subjects \
                     WHERE tenant_id = ?1 AND {column} IS NOT NULL \
                     AND {column} >= ?2 AND {column} <= ?3"
                ),
                params![
                    tenant_id.to_string(),
                    from.format("%Y-%m-%d").to_string(),
                    to.format("%Y-%m-%d").to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_subjects_with_event_between: {e}")))?;

        let mut subjects = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = match row.get(0) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping malformed subject row: {e}");
                    continue;
                }
            };
            let date_str: String = match row.get(1) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Skipping malformed subject row: {e}");
                    continue;
                }
            };
            match (Uuid::parse_str(&id_str), parse_date(&date_str)) {
                (Ok(id), Some(date)) => subjects.push((id, date)),
                _ => warn!("Skipping malformed subject row: {id_str}"),
            }
        }
        Ok(subjects)
    }
}
