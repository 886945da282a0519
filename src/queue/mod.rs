//! Durable, retryable delivery queue.
//!
//! Jobs become visible at `run_at`, are leased to one worker at a time and
//! either complete, retry with exponential backoff, or fail for good once
//! `max_attempts` is reached. A job whose lease expires (worker crashed) is
//! handed out again and counts as a new attempt.

pub mod job;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;

pub use job::{DeliveryJob, SendEmailJob};

/// Returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A job leased to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: DeliveryJob,
    /// 1-based attempt number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ClaimedJob {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The previous holder crashed on the last allowed attempt.
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }
}

/// What `fail` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retried { run_at: DateTime<Utc> },
    Failed,
}

/// Stored state of a job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueDepth {
    pub fn pending(&self) -> u64 {
        self.queued + self.running
    }
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Make `job` visible to workers no earlier than `run_at`.
    async fn enqueue_at(
        &self,
        job: &DeliveryJob,
        run_at: DateTime<Utc>,
    ) -> Result<JobHandle, QueueError>;

    /// Make `job` visible to workers after `delay`.
    async fn enqueue(&self, job: &DeliveryJob, delay: Duration) -> Result<JobHandle, QueueError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| QueueError::InvalidJob(format!("delay out of range: {e}")))?;
        self.enqueue_at(job, Utc::now() + delay).await
    }

    /// Lease up to `limit` due jobs to `worker_id`.
    async fn claim(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, QueueError>;

    async fn complete(&self, id: Uuid) -> Result<(), QueueError>;

    /// Record a failed attempt. Retries only if `retry` is set and attempts remain.
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

/// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
pub fn retry_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
    config
        .backoff_base
        .saturating_mul(factor)
        .min(config.backoff_max)
}
