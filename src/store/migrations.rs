//! Schema migrations for the outreach store.
//!
//! Versions are recorded in `schema_migrations`. A migration and its
//! version row commit in one transaction, so a crash mid-migration
//! leaves the store at the previous version.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text so that string
//! comparison in SQL matches chronological order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Applied in order; versions only ever grow.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "outreach_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                from_name TEXT,
                smtp_host TEXT NOT NULL,
                smtp_port INTEGER NOT NULL,
                smtp_username TEXT NOT NULL,
                smtp_password TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                sent_count INTEGER NOT NULL DEFAULT 0,
                daily_limit INTEGER NOT NULL DEFAULT 50,
                warmup_enabled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                mailbox_id TEXT,
                daily_limit INTEGER NOT NULL DEFAULT 50,
                timezone TEXT,
                start_time TEXT,
                end_time TEXT,
                pacing_interval_minutes INTEGER NOT NULL DEFAULT 5,
                scheduled_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                step_type TEXT NOT NULL DEFAULT 'email',
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                delay_days INTEGER NOT NULL DEFAULT 0,
                delay_hours INTEGER NOT NULL DEFAULT 0,
                condition TEXT NOT NULL DEFAULT 'always',
                UNIQUE(campaign_id, step_order)
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                company TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'new',
                classification TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(workspace_id, email)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(email COLLATE NOCASE);

            CREATE TABLE IF NOT EXISTS campaign_leads (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                current_step INTEGER NOT NULL DEFAULT 0,
                next_action_at TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(campaign_id, lead_id)
            );
            CREATE INDEX IF NOT EXISTS idx_campaign_leads_due
                ON campaign_leads(status, next_action_at);
            CREATE INDEX IF NOT EXISTS idx_campaign_leads_lead ON campaign_leads(lead_id);

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                campaign_id TEXT,
                lead_id TEXT NOT NULL,
                sequence_id TEXT,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_events_pair
                ON events(campaign_id, lead_id, event_type);
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delivery_jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                run_at TEXT NOT NULL,
                lease_expires_at TEXT,
                worker_id TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_jobs_ready
                ON delivery_jobs(status, run_at);

            CREATE TABLE IF NOT EXISTS pacing_ledger (
                mailbox_id TEXT PRIMARY KEY,
                next_slot TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Cannot create schema_migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying schema migration"
        );
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            migration.sql, migration.version, migration.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Leave no half-applied transaction on the shared connection.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} {} failed: {e}",
                migration.version, migration.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh store.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT MAX(version) FROM schema_migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Cannot read schema version: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Cannot read schema version: {e}")))?
    else {
        return Ok(0);
    };
    match row
        .get_value(0)
        .map_err(|e| DatabaseError::Migration(format!("Bad schema version: {e}")))?
    {
        libsql::Value::Integer(version) => Ok(version),
        _ => Ok(0),
    }
}
