//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "automation_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                stage_id TEXT,
                project_type TEXT,
                channel TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                kind_type TEXT NOT NULL,
                kind_config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_automations_tenant ON automations(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_automations_kind ON automations(kind_type);

            CREATE TABLE IF NOT EXISTS automation_steps (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL REFERENCES automations(id) ON DELETE CASCADE,
                step_index INTEGER NOT NULL,
                channel TEXT NOT NULL,
                content TEXT NOT NULL,
                delay TEXT NOT NULL,
                UNIQUE (automation_id, step_index)
            );
            CREATE INDEX IF NOT EXISTS idx_automation_steps_automation
                ON automation_steps(automation_id);

            CREATE TABLE IF NOT EXISTS business_triggers (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL REFERENCES automations(id) ON DELETE CASCADE,
                event_type TEXT NOT NULL,
                source_stage TEXT,
                UNIQUE (automation_id, event_type)
            );
            CREATE INDEX IF NOT EXISTS idx_business_triggers_event
                ON business_triggers(event_type);
        "#,
    },
    Migration {
        version: 2,
        name: "drip_campaigns",
        sql: r#"
            CREATE TABLE IF NOT EXISTS drip_campaigns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                target_stage TEXT NOT NULL,
                project_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_drip_campaigns_tenant ON drip_campaigns(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_drip_campaigns_stage ON drip_campaigns(target_stage);

            CREATE TABLE IF NOT EXISTS drip_campaign_emails (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES drip_campaigns(id) ON DELETE CASCADE,
                email_index INTEGER NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                offset_unit TEXT NOT NULL,
                offset_value INTEGER NOT NULL,
                approval TEXT NOT NULL DEFAULT 'pending',
                UNIQUE (campaign_id, email_index)
            );

            CREATE TABLE IF NOT EXISTS drip_subscriptions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL REFERENCES drip_campaigns(id) ON DELETE CASCADE,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                started_at TEXT NOT NULL,
                next_email_index INTEGER NOT NULL DEFAULT 0,
                next_email_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (campaign_id, project_id)
            );
            CREATE INDEX IF NOT EXISTS idx_drip_subscriptions_due
                ON drip_subscriptions(status, next_email_at);
        "#,
    },
    Migration {
        version: 3,
        name: "scheduler_state",
        sql: r#"
            CREATE TABLE IF NOT EXISTS due_items (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                automation_id TEXT NOT NULL,
                step_index INTEGER,
                subject_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                content TEXT NOT NULL,
                occurrence_key TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (automation_id, subject_id, occurrence_key)
            );
            CREATE INDEX IF NOT EXISTS idx_due_items_fire_at ON due_items(fire_at);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                rule_kind TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                occurrence_key TEXT NOT NULL,
                channel TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                provider_message_id TEXT,
                anomaly TEXT,
                executed_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_once
                ON executions(rule_kind, rule_id, subject_id, occurrence_key)
                WHERE status = 'sent';
            CREATE INDEX IF NOT EXISTS idx_executions_subject
                ON executions(tenant_id, subject_id);
        "#,
    },
    Migration {
        version: 4,
        name: "templates_settings_subjects",
        sql: r#"
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_templates_tenant ON templates(tenant_id);

            CREATE TABLE IF NOT EXISTS tenant_settings (
                tenant_id TEXT PRIMARY KEY,
                send_hour INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                first_name TEXT,
                email TEXT,
                phone TEXT,
                stage_id TEXT,
                project_type TEXT,
                wedding_date TEXT,
                session_date TEXT,
                fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subjects_tenant ON subjects(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_subjects_wedding ON subjects(tenant_id, wedding_date);
            CREATE INDEX IF NOT EXISTS idx_subjects_session ON subjects(tenant_id, session_date);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` tracking table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_apply_cleanly() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn success_index_blocks_duplicate_sends_only() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT OR IGNORE INTO executions
            (id, tenant_id, rule_kind, rule_id, subject_id, occurrence_key,
             channel, status, executed_at)
            VALUES (?1, 't1', 'automation', 'r1', 's1', 'o1', 'email', ?2, '2025-01-01')";

        let first = conn
            .execute(insert, libsql::params!["e1", "sent"])
            .await
            .unwrap();
        let duplicate = conn
            .execute(insert, libsql::params!["e2", "sent"])
            .await
            .unwrap();
        // Failed attempts are not constrained by the success index.
        let failed = conn
            .execute(insert, libsql::params!["e3", "failed"])
            .await
            .unwrap();
        let failed_again = conn
            .execute(insert, libsql::params!["e4", "failed"])
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(duplicate, 0);
        assert_eq!(failed, 1);
        assert_eq!(failed_again, 1);
    }
}
