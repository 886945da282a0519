//! libSQL implementation of the `Database` trait.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by the scheduler, the worker pool and the pacing ledger.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, Value, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::outreach::model::{
    Campaign, CampaignLead, CampaignLeadStatus, CampaignPlan, CampaignStatus, Event, EventType,
    Lead, Mailbox, MailboxStatus, ReplyClassification, SequenceStep, SmtpSettings,
};
use crate::outreach::window::SendWindow;
use crate::store::migrations;
use crate::store::traits::{Candidate, Database, StepAdvance};

/// libSQL database backend.
///
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
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

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a query and map every row.
    async fn query_all<T, P>(
        &self,
        op: &str,
        sql: &str,
        params: P,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError>
    where
        P: IntoParams + Send,
    {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| query_err(op, e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err(op, e))? {
            out.push(map(&row)?);
        }
        Ok(out)
    }

    async fn query_one<T, P>(
        &self,
        op: &str,
        sql: &str,
        params: P,
        map: fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError>
    where
        P: IntoParams + Send,
    {
        Ok(self.query_all(op, sql, params, map).await?.into_iter().next())
    }

    async fn execute<P>(&self, op: &str, sql: &str, params: P) -> Result<u64, DatabaseError>
    where
        P: IntoParams + Send,
    {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| query_err(op, e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width so text order is time order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(fmt_ts(dt)),
        None => Value::Null,
    }
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

/// Read a nullable text column.
pub(crate) fn text_opt(row: &Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match row.get_value(idx).map_err(col_err)? {
        Value::Text(s) => Ok(Some(s)),
        _ => Ok(None),
    }
}

pub(crate) fn text(row: &Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx).map_err(col_err)
}

pub(crate) fn int(row: &Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx).map_err(col_err)
}

pub(crate) fn uuid_col(row: &Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let s = text(row, idx)?;
    Uuid::parse_str(&s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn opt_uuid_col(row: &Row, idx: i32) -> Result<Option<Uuid>, DatabaseError> {
    text_opt(row, idx)?
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
        })
        .transpose()
}

pub(crate) fn ts_col(row: &Row, idx: i32) -> Result<DateTime<Utc>, DatabaseError> {
    parse_datetime(&text(row, idx)?)
}

pub(crate) fn opt_ts_col(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    text_opt(row, idx)?.map(|s| parse_datetime(&s)).transpose()
}

fn enum_col<T: FromStr<Err = String>>(row: &Row, idx: i32) -> Result<T, DatabaseError> {
    text(row, idx)?.parse().map_err(DatabaseError::Serialization)
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Serialization(format!("column read failed: {e}"))
}

pub(crate) fn query_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const ACTIVE_ROW_STATUSES: &str = "('new', 'contacted', 'sent')";

const MAILBOX_COLUMNS: &str = "id, email, name, from_name, smtp_host, smtp_port, smtp_username, smtp_password, status, sent_count, daily_limit, warmup_enabled, created_at";

const CAMPAIGN_COLUMNS: &str = "id, workspace_id, name, status, mailbox_id, daily_limit, timezone, start_time, end_time, pacing_interval_minutes, scheduled_at, created_at, updated_at";

const STEP_COLUMNS: &str =
    "id, campaign_id, step_order, step_type, subject, body, delay_days, delay_hours, condition";

const LEAD_COLUMNS: &str = "id, workspace_id, email, first_name, last_name, company, metadata, status, classification, created_at";

const CAMPAIGN_LEAD_COLUMNS: &str = "id, campaign_id, lead_id, status, current_step, next_action_at, failure_reason, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, event_type, campaign_id, lead_id, sequence_id, created_at, metadata";

fn row_to_mailbox(row: &Row) -> Result<Mailbox, DatabaseError> {
    Ok(Mailbox {
        id: uuid_col(row, 0)?,
        email: text(row, 1)?,
        name: text_opt(row, 2)?,
        from_name: text_opt(row, 3)?,
        smtp: SmtpSettings {
            host: text(row, 4)?,
            port: u16::try_from(int(row, 5)?).unwrap_or(587),
            username: text(row, 6)?,
            password: SecretString::from(text(row, 7)?),
        },
        status: enum_col(row, 8)?,
        sent_count: int(row, 9)?,
        daily_limit: int(row, 10)?,
        warmup_enabled: int(row, 11)? != 0,
        created_at: ts_col(row, 12)?,
    })
}

fn row_to_campaign(row: &Row) -> Result<Campaign, DatabaseError> {
    let id = uuid_col(row, 0)?;
    let timezone = text_opt(row, 6)?;
    let start = text_opt(row, 7)?;
    let end = text_opt(row, 8)?;
    let window = SendWindow::from_parts(timezone.as_deref(), start.as_deref(), end.as_deref())
        .map_err(|e| DatabaseError::Serialization(format!("campaign {id}: {e}")))?;

    Ok(Campaign {
        id,
        workspace_id: text(row, 1)?,
        name: text(row, 2)?,
        status: enum_col(row, 3)?,
        mailbox_id: opt_uuid_col(row, 4)?,
        daily_limit: int(row, 5)?,
        window,
        pacing_interval_minutes: u32::try_from(int(row, 9)?).unwrap_or(Campaign::DEFAULT_PACING_MINUTES),
        scheduled_at: opt_ts_col(row, 10)?,
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
    })
}

fn row_to_step(row: &Row) -> Result<SequenceStep, DatabaseError> {
    Ok(SequenceStep {
        id: uuid_col(row, 0)?,
        campaign_id: uuid_col(row, 1)?,
        order: u32::try_from(int(row, 2)?).unwrap_or(0),
        step_type: enum_col(row, 3)?,
        subject: text(row, 4)?,
        body: text(row, 5)?,
        delay_days: u32::try_from(int(row, 6)?).unwrap_or(0),
        delay_hours: u32::try_from(int(row, 7)?).unwrap_or(0),
        condition: enum_col(row, 8)?,
    })
}

fn row_to_lead(row: &Row) -> Result<Lead, DatabaseError> {
    let metadata_str = text(row, 6)?;
    let metadata = match serde_json::from_str::<serde_json::Value>(&metadata_str) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let classification = match text_opt(row, 8)? {
        Some(s) => Some(
            ReplyClassification::from_str(&s).map_err(DatabaseError::Serialization)?,
        ),
        None => None,
    };

    Ok(Lead {
        id: uuid_col(row, 0)?,
        workspace_id: text(row, 1)?,
        email: text(row, 2)?,
        first_name: text_opt(row, 3)?,
        last_name: text_opt(row, 4)?,
        company: text_opt(row, 5)?,
        metadata,
        status: enum_col(row, 7)?,
        classification,
        created_at: ts_col(row, 9)?,
    })
}

fn row_to_campaign_lead(row: &Row) -> Result<CampaignLead, DatabaseError> {
    Ok(CampaignLead {
        id: uuid_col(row, 0)?,
        campaign_id: uuid_col(row, 1)?,
        lead_id: uuid_col(row, 2)?,
        status: enum_col(row, 3)?,
        current_step: u32::try_from(int(row, 4)?).unwrap_or(0),
        next_action_at: opt_ts_col(row, 5)?,
        failure_reason: text_opt(row, 6)?,
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

fn row_to_event(row: &Row) -> Result<Event, DatabaseError> {
    let metadata = serde_json::from_str(&text(row, 6)?)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    Ok(Event {
        id: uuid_col(row, 0)?,
        event_type: enum_col(row, 1)?,
        campaign_id: opt_uuid_col(row, 2)?,
        lead_id: uuid_col(row, 3)?,
        sequence_id: opt_uuid_col(row, 4)?,
        created_at: ts_col(row, 5)?,
        metadata,
    })
}

fn row_to_uuid(row: &Row) -> Result<Uuid, DatabaseError> {
    uuid_col(row, 0)
}

fn row_to_count(row: &Row) -> Result<i64, DatabaseError> {
    int(row, 0)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError> {
        self.execute(
            "insert_mailbox",
            &format!(
                "INSERT INTO mailboxes ({MAILBOX_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                mailbox.id.to_string(),
                mailbox.email.clone(),
                opt_text(mailbox.name.as_deref()),
                opt_text(mailbox.from_name.as_deref()),
                mailbox.smtp.host.clone(),
                i64::from(mailbox.smtp.port),
                mailbox.smtp.username.clone(),
                mailbox.smtp.password.expose_secret().to_string(),
                mailbox.status.as_str(),
                mailbox.sent_count,
                mailbox.daily_limit,
                i64::from(mailbox.warmup_enabled),
                fmt_ts(mailbox.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError> {
        self.query_one(
            "get_mailbox",
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"),
            params![id.to_string()],
            row_to_mailbox,
        )
        .await
    }

    async fn get_mailbox_by_email(&self, email: &str) -> Result<Option<Mailbox>, DatabaseError> {
        self.query_one(
            "get_mailbox_by_email",
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE email = ?1 COLLATE NOCASE"),
            params![email.trim()],
            row_to_mailbox,
        )
        .await
    }

    async fn list_mailboxes(
        &self,
        status: Option<MailboxStatus>,
    ) -> Result<Vec<Mailbox>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_all(
                    "list_mailboxes",
                    &format!(
                        "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE status = ?1 ORDER BY created_at"
                    ),
                    params![status.as_str()],
                    row_to_mailbox,
                )
                .await
            }
            None => {
                self.query_all(
                    "list_mailboxes",
                    &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes ORDER BY created_at"),
                    (),
                    row_to_mailbox,
                )
                .await
            }
        }
    }

    async fn list_warmup_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError> {
        self.query_all(
            "list_warmup_mailboxes",
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE warmup_enabled = 1"),
            (),
            row_to_mailbox,
        )
        .await
    }

    async fn raise_daily_limit(&self, id: Uuid, target: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "raise_daily_limit",
                "UPDATE mailboxes SET daily_limit = ?2 WHERE id = ?1 AND daily_limit < ?2",
                params![id.to_string(), target],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn reserve_send(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "reserve_send",
                "UPDATE mailboxes SET sent_count = sent_count + 1 WHERE id = ?1 AND sent_count < daily_limit",
                params![id.to_string()],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn release_send(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.execute(
            "release_send",
            "UPDATE mailboxes SET sent_count = sent_count - 1 WHERE id = ?1 AND sent_count > 0",
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn reset_sent_count(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.execute(
            "reset_sent_count",
            "UPDATE mailboxes SET sent_count = 0 WHERE id = ?1",
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let metadata = serde_json::Value::Object(lead.metadata.clone()).to_string();
        self.execute(
            "insert_lead",
            &format!(
                "INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                lead.id.to_string(),
                lead.workspace_id.clone(),
                lead.email.clone(),
                opt_text(lead.first_name.as_deref()),
                opt_text(lead.last_name.as_deref()),
                opt_text(lead.company.as_deref()),
                metadata,
                lead.status.as_str(),
                opt_text(lead.classification.map(|c| c.as_str())),
                fmt_ts(lead.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        self.query_one(
            "get_lead",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
            params![id.to_string()],
            row_to_lead,
        )
        .await
    }

    async fn find_leads_by_email(&self, email: &str) -> Result<Vec<Lead>, DatabaseError> {
        self.query_all(
            "find_leads_by_email",
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1 COLLATE NOCASE"),
            params![email.trim()],
            row_to_lead,
        )
        .await
    }

    async fn mark_lead_replied(
        &self,
        id: Uuid,
        classification: ReplyClassification,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "mark_lead_replied",
            "UPDATE leads SET status = 'replied', classification = ?2 WHERE id = ?1",
            params![id.to_string(), classification.as_str()],
        )
        .await?;
        Ok(())
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let (timezone, start, end) = campaign.window.to_parts();
        self.execute(
            "insert_campaign",
            &format!(
                "INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                campaign.id.to_string(),
                campaign.workspace_id.clone(),
                campaign.name.clone(),
                campaign.status.as_str(),
                opt_text(campaign.mailbox_id.map(|id| id.to_string()).as_deref()),
                campaign.daily_limit,
                opt_text(timezone.as_deref()),
                opt_text(start.as_deref()),
                opt_text(end.as_deref()),
                i64::from(campaign.pacing_interval_minutes),
                opt_ts(campaign.scheduled_at),
                fmt_ts(campaign.created_at),
                fmt_ts(campaign.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        self.query_one(
            "get_campaign",
            &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
            params![id.to_string()],
            row_to_campaign,
        )
        .await
    }

    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>, DatabaseError> {
        self.query_all(
            "list_campaigns",
            &format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ?1 ORDER BY created_at, id"
            ),
            params![status.as_str()],
            row_to_campaign,
        )
        .await
    }

    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .execute(
                "set_campaign_status",
                "UPDATE campaigns SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), fmt_ts(Utc::now())],
            )
            .await?;
        if changed == 0 {
            return Err(DatabaseError::not_found("campaign", id));
        }
        Ok(())
    }

    async fn transition_campaign_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "transition_campaign_status",
                "UPDATE campaigns SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), from.as_str(), to.as_str(), fmt_ts(Utc::now())],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let id = id.to_string();
        self.execute(
            "delete_campaign",
            "DELETE FROM events WHERE campaign_id = ?1",
            params![id.clone()],
        )
        .await?;
        self.execute(
            "delete_campaign",
            "DELETE FROM campaign_leads WHERE campaign_id = ?1",
            params![id.clone()],
        )
        .await?;
        self.execute(
            "delete_campaign",
            "DELETE FROM sequences WHERE campaign_id = ?1",
            params![id.clone()],
        )
        .await?;
        let deleted = self
            .execute(
                "delete_campaign",
                "DELETE FROM campaigns WHERE id = ?1",
                params![id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn insert_step(&self, step: &SequenceStep) -> Result<(), DatabaseError> {
        self.execute(
            "insert_step",
            &format!("INSERT INTO sequences ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                step.id.to_string(),
                step.campaign_id.to_string(),
                i64::from(step.order),
                step.step_type.as_str(),
                step.subject.clone(),
                step.body.clone(),
                i64::from(step.delay_days),
                i64::from(step.delay_hours),
                step.condition.as_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError> {
        self.query_all(
            "list_steps",
            &format!(
                "SELECT {STEP_COLUMNS} FROM sequences WHERE campaign_id = ?1 ORDER BY step_order ASC"
            ),
            params![campaign_id.to_string()],
            row_to_step,
        )
        .await
    }

    async fn load_plan(&self, campaign_id: Uuid) -> Result<Option<CampaignPlan>, DatabaseError> {
        let Some(campaign) = self.get_campaign(campaign_id).await? else {
            return Ok(None);
        };
        let steps = self.list_steps(campaign_id).await?;
        let mailbox = match campaign.mailbox_id {
            Some(mailbox_id) => self.get_mailbox(mailbox_id).await?,
            None => None,
        };
        Ok(Some(CampaignPlan {
            campaign,
            steps,
            mailbox,
        }))
    }

    // ── Campaign leads ──────────────────────────────────────────────

    async fn insert_campaign_lead(&self, row: &CampaignLead) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "insert_campaign_lead",
                &format!(
                    "INSERT OR IGNORE INTO campaign_leads ({CAMPAIGN_LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    row.id.to_string(),
                    row.campaign_id.to_string(),
                    row.lead_id.to_string(),
                    row.status.as_str(),
                    i64::from(row.current_step),
                    opt_ts(row.next_action_at),
                    opt_text(row.failure_reason.as_deref()),
                    fmt_ts(row.created_at),
                    fmt_ts(row.updated_at),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn get_campaign_lead(&self, id: Uuid) -> Result<Option<CampaignLead>, DatabaseError> {
        self.query_one(
            "get_campaign_lead",
            &format!("SELECT {CAMPAIGN_LEAD_COLUMNS} FROM campaign_leads WHERE id = ?1"),
            params![id.to_string()],
            row_to_campaign_lead,
        )
        .await
    }

    async fn find_campaign_lead(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<CampaignLead>, DatabaseError> {
        self.query_one(
            "find_campaign_lead",
            &format!(
                "SELECT {CAMPAIGN_LEAD_COLUMNS} FROM campaign_leads WHERE campaign_id = ?1 AND lead_id = ?2"
            ),
            params![campaign_id.to_string(), lead_id.to_string()],
            row_to_campaign_lead,
        )
        .await
    }

    async fn list_campaign_leads(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignLead>, DatabaseError> {
        self.query_all(
            "list_campaign_leads",
            &format!(
                "SELECT {CAMPAIGN_LEAD_COLUMNS} FROM campaign_leads WHERE campaign_id = ?1 ORDER BY created_at, id"
            ),
            params![campaign_id.to_string()],
            row_to_campaign_lead,
        )
        .await
    }

    async fn due_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candidate>, DatabaseError> {
        let sql = format!(
            "SELECT cl.id, cl.campaign_id, cl.lead_id, cl.status, cl.current_step, cl.next_action_at, cl.failure_reason, cl.created_at, cl.updated_at
             FROM campaign_leads cl
             JOIN campaigns c ON c.id = cl.campaign_id
             WHERE c.status = 'active'
               AND (c.scheduled_at IS NULL OR c.scheduled_at <= ?1)
               AND cl.status IN {ACTIVE_ROW_STATUSES}
               AND ((cl.next_action_at IS NOT NULL AND cl.next_action_at <= ?1)
                    OR (cl.next_action_at IS NULL
                        AND cl.current_step >= (SELECT COUNT(*) FROM sequences s WHERE s.campaign_id = cl.campaign_id)))
             ORDER BY cl.next_action_at ASC, cl.id ASC
             LIMIT ?2"
        );
        let rows = self
            .query_all(
                "due_candidates",
                &sql,
                params![fmt_ts(now), limit as i64],
                row_to_campaign_lead,
            )
            .await?;

        let mut plans: HashMap<Uuid, Option<Arc<CampaignPlan>>> = HashMap::new();
        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            if !plans.contains_key(&row.campaign_id) {
                let plan = match self.load_plan(row.campaign_id).await {
                    Ok(plan) => plan.map(Arc::new),
                    Err(e) => {
                        warn!(campaign_id = %row.campaign_id, "Skipping misconfigured campaign: {}", e);
                        None
                    }
                };
                plans.insert(row.campaign_id, plan);
            }
            let Some(Some(plan)) = plans.get(&row.campaign_id) else {
                continue;
            };

            let lead = match self.get_lead(row.lead_id).await? {
                Some(lead) => lead,
                None => {
                    warn!(campaign_lead_id = %row.id, lead_id = %row.lead_id, "Campaign lead references a missing lead");
                    continue;
                }
            };
            candidates.push(Candidate {
                row,
                plan: Arc::clone(plan),
                lead,
            });
        }
        Ok(candidates)
    }

    async fn reschedule_campaign_lead(
        &self,
        id: Uuid,
        expected_step: u32,
        next_action_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "reschedule_campaign_lead",
                &format!(
                    "UPDATE campaign_leads SET next_action_at = ?3, updated_at = ?4
                     WHERE id = ?1 AND current_step = ?2 AND status IN {ACTIVE_ROW_STATUSES}"
                ),
                params![
                    id.to_string(),
                    i64::from(expected_step),
                    fmt_ts(next_action_at),
                    fmt_ts(Utc::now()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn advance_campaign_lead(
        &self,
        id: Uuid,
        from_step: u32,
        advance: &StepAdvance,
    ) -> Result<bool, DatabaseError> {
        if advance.to_step <= from_step {
            return Ok(false);
        }
        let changed = self
            .execute(
                "advance_campaign_lead",
                &format!(
                    "UPDATE campaign_leads
                     SET current_step = ?3, status = COALESCE(?4, status), next_action_at = ?5, updated_at = ?6
                     WHERE id = ?1 AND current_step = ?2 AND status IN {ACTIVE_ROW_STATUSES}"
                ),
                params![
                    id.to_string(),
                    i64::from(from_step),
                    i64::from(advance.to_step),
                    opt_text(advance.status.map(|s| s.as_str())),
                    opt_ts(advance.next_action_at),
                    fmt_ts(Utc::now()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn finish_campaign_lead(
        &self,
        id: Uuid,
        status: CampaignLeadStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if status.is_active() {
            return Ok(false);
        }
        let changed = self
            .execute(
                "finish_campaign_lead",
                &format!(
                    "UPDATE campaign_leads
                     SET status = ?2, next_action_at = NULL, failure_reason = COALESCE(?3, failure_reason), updated_at = ?4
                     WHERE id = ?1
                       AND (status IN {ACTIVE_ROW_STATUSES} OR (?2 = 'failed' AND status = 'ignored'))"
                ),
                params![
                    id.to_string(),
                    status.as_str(),
                    opt_text(failure_reason),
                    fmt_ts(Utc::now()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_campaign_lead_sent(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "mark_campaign_lead_sent",
                "UPDATE campaign_leads SET status = 'sent', updated_at = ?2
                 WHERE id = ?1 AND status IN ('new', 'contacted')",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_lead_rows_replied(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<CampaignLead>, DatabaseError> {
        self.query_all(
            "mark_lead_rows_replied",
            &format!(
                "UPDATE campaign_leads SET status = 'replied', next_action_at = NULL, updated_at = ?2
                 WHERE lead_id = ?1 AND status IN {ACTIVE_ROW_STATUSES}
                 RETURNING {CAMPAIGN_LEAD_COLUMNS}"
            ),
            params![lead_id.to_string(), fmt_ts(Utc::now())],
            row_to_campaign_lead,
        )
        .await
    }

    async fn count_pending_campaign_leads(&self, campaign_id: Uuid) -> Result<u64, DatabaseError> {
        let count = self
            .query_one(
                "count_pending_campaign_leads",
                &format!(
                    "SELECT COUNT(*) FROM campaign_leads
                     WHERE campaign_id = ?1 AND status IN {ACTIVE_ROW_STATUSES}
                       AND (next_action_at IS NOT NULL
                            OR current_step >= (SELECT COUNT(*) FROM sequences s WHERE s.campaign_id = ?1))"
                ),
                params![campaign_id.to_string()],
                row_to_count,
            )
            .await?
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn campaign_lead_tally(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashMap<CampaignLeadStatus, u64>, DatabaseError> {
        fn row_to_pair(row: &Row) -> Result<(CampaignLeadStatus, u64), DatabaseError> {
            Ok((enum_col(row, 0)?, int(row, 1)?.max(0) as u64))
        }
        let pairs = self
            .query_all(
                "campaign_lead_tally",
                "SELECT status, COUNT(*) FROM campaign_leads WHERE campaign_id = ?1 GROUP BY status",
                params![campaign_id.to_string()],
                row_to_pair,
            )
            .await?;
        Ok(pairs.into_iter().collect())
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError> {
        self.execute(
            "insert_event",
            &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                event.id.to_string(),
                event.event_type.as_str(),
                opt_text(event.campaign_id.map(|id| id.to_string()).as_deref()),
                event.lead_id.to_string(),
                opt_text(event.sequence_id.map(|id| id.to_string()).as_deref()),
                fmt_ts(event.created_at),
                event.metadata.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn has_event(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        event_type: EventType,
    ) -> Result<bool, DatabaseError> {
        let found = self
            .query_one(
                "has_event",
                "SELECT 1 FROM events WHERE campaign_id = ?1 AND lead_id = ?2 AND event_type = ?3 LIMIT 1",
                params![campaign_id.to_string(), lead_id.to_string(), event_type.as_str()],
                row_to_count,
            )
            .await?;
        Ok(found.is_some())
    }

    async fn list_events(&self, lead_id: Uuid) -> Result<Vec<Event>, DatabaseError> {
        self.query_all(
            "list_events",
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE lead_id = ?1 ORDER BY created_at, rowid"
            ),
            params![lead_id.to_string()],
            row_to_event,
        )
        .await
    }

    async fn leads_without_event(
        &self,
        campaign_id: Uuid,
        event_type: EventType,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        self.query_all(
            "leads_without_event",
            "SELECT cl.lead_id FROM campaign_leads cl
             WHERE cl.campaign_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM events e
                   WHERE e.campaign_id = cl.campaign_id AND e.lead_id = cl.lead_id AND e.event_type = ?2)
             ORDER BY cl.created_at, cl.id",
            params![campaign_id.to_string(), event_type.as_str()],
            row_to_uuid,
        )
        .await
    }
}
