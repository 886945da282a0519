//! Delivery queue on the `delivery_jobs` table.
//!
//! Claiming is one `UPDATE .. RETURNING` statement, so concurrent workers
//! sharing the database never lease the same job twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DatabaseError, QueueError};
use crate::queue::{
    ClaimedJob, DeliveryJob, DeliveryQueue, FailOutcome, JobHandle, JobRecord, JobStatus,
    QueueDepth, retry_delay,
};
use crate::store::libsql_backend::{
    LibSqlBackend, fmt_ts, int, query_err, text, text_opt, ts_col, uuid_col,
};

/// `DeliveryQueue` backed by libSQL.
#[derive(Clone)]
pub struct LibSqlQueue {
    conn: Connection,
    config: QueueConfig,
}

impl LibSqlBackend {
    /// A delivery queue sharing this backend's connection.
    pub fn delivery_queue(&self, config: QueueConfig) -> LibSqlQueue {
        LibSqlQueue {
            conn: self.conn().clone(),
            config,
        }
    }
}

impl LibSqlQueue {
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn fail_malformed(&self, id: Uuid, error: &str, now: DateTime<Utc>) {
        let result = self
            .conn
            .execute(
                "UPDATE delivery_jobs SET status = 'failed', last_error = ?2, lease_expires_at = NULL, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), error, fmt_ts(now)],
            )
            .await;
        if let Err(e) = result {
            warn!(job_id = %id, "Failed to park malformed job: {}", e);
        }
    }
}

fn storage(op: &str, e: libsql::Error) -> QueueError {
    QueueError::Storage(query_err(op, e))
}

fn attempts(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[async_trait]
impl DeliveryQueue for LibSqlQueue {
    async fn enqueue_at(
        &self,
        job: &DeliveryJob,
        run_at: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError> {
        let payload = job.to_payload()?;
        let id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());
        self.conn
            .execute(
                "INSERT INTO delivery_jobs (id, job_type, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    job.job_type(),
                    payload,
                    i64::from(self.config.max_attempts),
                    fmt_ts(run_at),
                    now,
                ],
            )
            .await
            .map_err(|e| storage("enqueue", e))?;
        debug!(job_id = %id, job_type = job.job_type(), run_at = %run_at, "Job enqueued");
        Ok(JobHandle { id, run_at })
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let lease = chrono::Duration::from_std(self.config.lease)
            .map_err(|e| QueueError::InvalidJob(format!("lease out of range: {e}")))?;
        let now_s = fmt_ts(now);

        let mut rows = self
            .conn
            .query(
                "UPDATE delivery_jobs
                 SET status = 'running', attempts = attempts + 1, worker_id = ?1,
                     lease_expires_at = ?2, updated_at = ?3
                 WHERE id IN (
                     SELECT id FROM delivery_jobs
                     WHERE (status = 'queued' AND run_at <= ?3)
                        OR (status = 'running' AND lease_expires_at <= ?3)
                     ORDER BY run_at ASC, id ASC
                     LIMIT ?4)
                 RETURNING id, payload, attempts, max_attempts, run_at",
                params![worker_id, fmt_ts(now + lease), now_s, limit as i64],
            )
            .await
            .map_err(|e| storage("claim", e))?;

        let mut raw = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| storage("claim", e))? {
            raw.push((
                uuid_col(&row, 0)?,
                text(&row, 1)?,
                attempts(int(&row, 2)?),
                attempts(int(&row, 3)?),
                ts_col(&row, 4)?,
            ));
        }
        drop(rows);
        raw.sort_by(|a, b| a.4.cmp(&b.4).then(a.0.cmp(&b.0)));

        let mut claimed = Vec::with_capacity(raw.len());
        for (id, payload, attempt, max_attempts, _) in raw {
            match DeliveryJob::from_payload(&payload) {
                Ok(job) => claimed.push(ClaimedJob {
                    id,
                    job,
                    attempt,
                    max_attempts,
                }),
                Err(e) => {
                    warn!(job_id = %id, "Dropping malformed job: {}", e);
                    self.fail_malformed(id, &e.to_string(), now).await;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        let changed = self
            .conn
            .execute(
                "UPDATE delivery_jobs SET status = 'completed', lease_expires_at = NULL, last_error = NULL, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| storage("complete", e))?;
        if changed == 0 {
            return match self.get_job(id).await? {
                None => Err(QueueError::NotFound(id)),
                Some(record) => Err(QueueError::NotRunning {
                    id,
                    status: record.status.as_str().to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let record = self.get_job(id).await?.ok_or(QueueError::NotFound(id))?;
        if record.status != JobStatus::Running {
            return Err(QueueError::NotRunning {
                id,
                status: record.status.as_str().to_string(),
            });
        }

        if retry && record.attempts < record.max_attempts {
            let delay = chrono::Duration::from_std(retry_delay(&self.config, record.attempts))
                .map_err(|e| QueueError::InvalidJob(format!("backoff out of range: {e}")))?;
            let run_at = now + delay;
            self.conn
                .execute(
                    "UPDATE delivery_jobs
                     SET status = 'queued', run_at = ?2, last_error = ?3, lease_expires_at = NULL, worker_id = NULL, updated_at = ?4
                     WHERE id = ?1 AND status = 'running'",
                    params![id.to_string(), fmt_ts(run_at), error, fmt_ts(now)],
                )
                .await
                .map_err(|e| storage("fail", e))?;
            debug!(job_id = %id, attempt = record.attempts, run_at = %run_at, "Job scheduled for retry");
            return Ok(FailOutcome::Retried { run_at });
        }

        self.conn
            .execute(
                "UPDATE delivery_jobs
                 SET status = 'failed', last_error = ?2, lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), error, fmt_ts(now)],
            )
            .await
            .map_err(|e| storage("fail", e))?;
        warn!(job_id = %id, attempts = record.attempts, "Job failed permanently: {}", error);
        Ok(FailOutcome::Failed)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_type, status, attempts, max_attempts, run_at, last_error FROM delivery_jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| storage("get_job", e))?;

        let Some(row) = rows.next().await.map_err(|e| storage("get_job", e))? else {
            return Ok(None);
        };
        let status: JobStatus = text(&row, 2)?
            .parse()
            .map_err(|e: String| QueueError::Storage(DatabaseError::Serialization(e)))?;
        Ok(Some(JobRecord {
            id: uuid_col(&row, 0)?,
            job_type: text(&row, 1)?,
            status,
            attempts: attempts(int(&row, 3)?),
            max_attempts: attempts(int(&row, 4)?),
            run_at: ts_col(&row, 5)?,
            last_error: text_opt(&row, 6)?,
        }))
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM delivery_jobs GROUP BY status",
                (),
            )
            .await
            .map_err(|e| storage("depth", e))?;

        let mut depth = QueueDepth::default();
        while let Some(row) = rows.next().await.map_err(|e| storage("depth", e))? {
            let count = int(&row, 1)?.max(0) as u64;
            match text(&row, 0)?.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => depth.queued = count,
                Ok(JobStatus::Running) => depth.running = count,
                Ok(JobStatus::Completed) => depth.completed = count,
                Ok(JobStatus::Failed) => depth.failed = count,
                Err(e) => warn!("Ignoring jobs with unknown status: {}", e),
            }
        }
        Ok(depth)
    }
}
