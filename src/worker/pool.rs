//! Claims due jobs and runs them through the send worker, rate limited.

use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, warn};

use super::send_worker::{SendOutcome, SendWorker};
use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::queue::{DeliveryQueue, FailOutcome};

/// Counters from one poll of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Queue bookkeeping that did not go through.
    pub errors: usize,
}

pub struct DeliveryWorkerPool {
    queue: Arc<dyn DeliveryQueue>,
    worker: SendWorker,
    limiter: DefaultDirectRateLimiter,
    config: WorkerConfig,
}

impl DeliveryWorkerPool {
    pub fn new(queue: Arc<dyn DeliveryQueue>, worker: SendWorker, config: WorkerConfig) -> Self {
        let per_second = NonZeroU32::new(config.sends_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            queue,
            worker,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<PoolReport, QueueError> {
        self.run_once_at(Utc::now()).await
    }

    /// Claim up to `concurrency` due jobs and run them concurrently.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<PoolReport, QueueError> {
        let jobs = self
            .queue
            .claim(&self.config.worker_id, self.config.concurrency, now)
            .await?;
        let mut report = PoolReport {
            claimed: jobs.len(),
            ..PoolReport::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let outcomes = join_all(jobs.iter().map(|job| async move {
            self.limiter.until_ready().await;
            self.worker.handle(job).await
        }))
        .await;

        for (job, outcome) in jobs.iter().zip(outcomes) {
            let result = match &outcome {
                SendOutcome::Sent { .. } => {
                    report.sent += 1;
                    self.queue.complete(job.id).await
                }
                SendOutcome::Retry { error } => {
                    match self.queue.fail(job.id, error, true, now).await {
                        Ok(FailOutcome::Retried { run_at }) => {
                            report.retried += 1;
                            debug!(job_id = %job.id, run_at = %run_at, "Job scheduled for retry");
                            Ok(())
                        }
                        Ok(FailOutcome::Failed) => {
                            report.failed += 1;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                SendOutcome::Failed { reason } => {
                    report.failed += 1;
                    self.queue.fail(job.id, reason, false, now).await.map(|_| ())
                }
            };
            if let Err(e) = result {
                // The lease will expire and the job is handed out again.
                warn!(job_id = %job.id, "Failed to settle job: {}", e);
                report.errors += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use secrecy::SecretString;

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::MailerError;
    use crate::mailer::{Mailer, OutboundEmail};
    use crate::outreach::model::{Campaign, Lead, Mailbox, SmtpSettings};
    use crate::queue::{DeliveryJob, JobStatus, SendEmailJob};
    use crate::store::{Database, LibSqlBackend, LibSqlQueue};

    struct FlakyMailer {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, _: &Mailbox, _: &OutboundEmail) -> Result<String, MailerError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(MailerError::Transient("451 try again".into()));
            }
            Ok("<id@example.com>".into())
        }
    }

    struct Harness {
        _db: Arc<LibSqlBackend>,
        queue: Arc<LibSqlQueue>,
        pool: DeliveryWorkerPool,
        job: DeliveryJob,
    }

    async fn harness(failures: u32) -> Harness {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Mailbox::new(
            "sales@example.com",
            SmtpSettings {
                host: "smtp.example.com".into(),
                port: 587,
                username: "u".into(),
                password: SecretString::from("p".to_string()),
            },
        );
        db.insert_mailbox(&mailbox).await.unwrap();
        let campaign = Campaign::new("ws", "c").with_mailbox(mailbox.id);
        db.insert_campaign(&campaign).await.unwrap();
        let lead = Lead::new("ws", "lead@example.org");
        db.insert_lead(&lead).await.unwrap();

        let queue = Arc::new(db.delivery_queue(QueueConfig::default()));
        let worker = SendWorker::new(
            db.clone(),
            Arc::new(FlakyMailer {
                failures_left: Mutex::new(failures),
            }),
        );
        let pool = DeliveryWorkerPool::new(
            queue.clone(),
            worker,
            WorkerConfig {
                worker_id: "w1".into(),
                sends_per_second: 100,
                ..WorkerConfig::default()
            },
        );
        let job = DeliveryJob::SendEmail(SendEmailJob {
            campaign_id: campaign.id,
            lead_id: lead.id,
            campaign_lead_id: uuid::Uuid::new_v4(),
            sequence_id: uuid::Uuid::new_v4(),
            step_order: 0,
            to: Some(lead.email.clone()),
            subject: "Hi".into(),
            body: "b".into(),
            mailbox_email: mailbox.email.clone(),
            mailbox_name: None,
            reply_to: None,
        });
        Harness {
            _db: db,
            queue,
            pool,
            job,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn sends_and_completes_due_jobs() {
        let h = harness(0).await;
        let handle = h.queue.enqueue_at(&h.job, t0()).await.unwrap();

        let report = h.pool.run_once_at(t0()).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.sent, 1);

        let record = h.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let h = harness(1).await;
        let handle = h.queue.enqueue_at(&h.job, t0()).await.unwrap();

        let first = h.pool.run_once_at(t0()).await.unwrap();
        assert_eq!(first.retried, 1);
        let record = h.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.run_at, t0() + Duration::seconds(10));

        // Not visible before the backoff elapses.
        assert_eq!(h.pool.run_once_at(t0()).await.unwrap().claimed, 0);

        let second = h.pool.run_once_at(t0() + Duration::seconds(10)).await.unwrap();
        assert_eq!(second.sent, 1);
        let record = h.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let h = harness(10).await;
        let handle = h.queue.enqueue_at(&h.job, t0()).await.unwrap();

        let mut now = t0();
        for _ in 0..3 {
            h.pool.run_once_at(now).await.unwrap();
            now += Duration::minutes(10);
        }
        let record = h.queue.get_job(handle.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.unwrap().contains("451"));
    }
}
