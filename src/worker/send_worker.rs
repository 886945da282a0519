//! Executes one claimed delivery job.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, MailerError};
use crate::mailer::{Mailer, OutboundEmail, TrackingIds};
use crate::outreach::model::{CampaignLeadStatus, Event, EventType, Mailbox};
use crate::queue::{ClaimedJob, DeliveryJob, SendEmailJob};
use crate::store::Database;

/// What the pool should tell the queue about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: String },
    /// Try again after backoff.
    Retry { error: String },
    /// Terminal; the campaign-lead has been marked failed.
    Failed { reason: String },
}

/// Sends claimed jobs through a `Mailer` and records the result.
///
/// The worker never moves `current_step`; the scheduler already advanced
/// it when the job was queued. A job is at-least-once, so a crash between
/// the send and `complete` can deliver the same step twice.
pub struct SendWorker {
    db: Arc<dyn Database>,
    mailer: Arc<dyn Mailer>,
}

impl SendWorker {
    pub fn new(db: Arc<dyn Database>, mailer: Arc<dyn Mailer>) -> Self {
        Self { db, mailer }
    }

    pub async fn handle(&self, claimed: &ClaimedJob) -> SendOutcome {
        match &claimed.job {
            DeliveryJob::SendEmail(job) => self.send_email(claimed, job).await,
        }
    }

    async fn send_email(&self, claimed: &ClaimedJob, job: &SendEmailJob) -> SendOutcome {
        if claimed.is_exhausted() {
            let reason = format!(
                "delivery abandoned after {} attempts",
                claimed.max_attempts
            );
            return self.fail_terminal(claimed, job, reason).await;
        }

        let mailbox = match self.db.get_mailbox_by_email(&job.mailbox_email).await {
            Ok(Some(mailbox)) => mailbox,
            Ok(None) => {
                let reason = format!("sending mailbox {} no longer exists", job.mailbox_email);
                return self.fail_terminal(claimed, job, reason).await;
            }
            Err(e) => return self.store_failure(claimed, job, e).await,
        };

        let to = match &job.to {
            Some(to) => to.clone(),
            None => match self.db.get_lead(job.lead_id).await {
                Ok(Some(lead)) => lead.email,
                Ok(None) => {
                    let reason = format!("lead {} no longer exists", job.lead_id);
                    return self.fail_terminal(claimed, job, reason).await;
                }
                Err(e) => return self.store_failure(claimed, job, e).await,
            },
        };

        let email = OutboundEmail {
            to,
            subject: job.subject.clone(),
            html: job.body.clone(),
            reply_to: job.reply_to.clone(),
            tracking: Some(TrackingIds {
                campaign_lead_id: job.campaign_lead_id,
                sequence_id: Some(job.sequence_id),
            }),
        };

        debug!(
            job_id = %claimed.id,
            attempt = claimed.attempt,
            to = %email.to,
            "Sending queued email"
        );
        match self.mailer.send(&mailbox, &email).await {
            Ok(message_id) => {
                self.record_sent(claimed, job, &message_id).await;
                SendOutcome::Sent { message_id }
            }
            Err(e) => self.send_failure(claimed, job, &mailbox, e).await,
        }
    }

    async fn send_failure(
        &self,
        claimed: &ClaimedJob,
        job: &SendEmailJob,
        mailbox: &Mailbox,
        e: MailerError,
    ) -> SendOutcome {
        if e.needs_operator() {
            error!(
                mailbox = %mailbox.email,
                "Mailbox needs attention — check its SMTP settings: {}", e
            );
        }
        if !e.is_retryable() || claimed.is_final_attempt() {
            return self.fail_terminal(claimed, job, e.to_string()).await;
        }
        warn!(
            job_id = %claimed.id,
            attempt = claimed.attempt,
            max_attempts = claimed.max_attempts,
            "Send failed, will retry: {}", e
        );
        SendOutcome::Retry {
            error: e.to_string(),
        }
    }

    async fn store_failure(
        &self,
        claimed: &ClaimedJob,
        job: &SendEmailJob,
        e: DatabaseError,
    ) -> SendOutcome {
        if claimed.is_final_attempt() {
            return self.fail_terminal(claimed, job, e.to_string()).await;
        }
        warn!(job_id = %claimed.id, "Store unavailable before send: {}", e);
        SendOutcome::Retry {
            error: e.to_string(),
        }
    }

    /// The mail is out; bookkeeping failures are logged but never undo it.
    async fn record_sent(&self, claimed: &ClaimedJob, job: &SendEmailJob, message_id: &str) {
        match self.db.mark_campaign_lead_sent(job.campaign_lead_id).await {
            Ok(true) => {}
            Ok(false) => debug!(
                campaign_lead_id = %job.campaign_lead_id,
                "Campaign lead already settled, status left as is"
            ),
            Err(e) => warn!(
                campaign_lead_id = %job.campaign_lead_id,
                "Failed to mark campaign lead sent: {}", e
            ),
        }

        let event = Event::new(EventType::EmailSent, job.lead_id)
            .campaign(job.campaign_id)
            .step(job.sequence_id)
            .metadata(json!({
                "message_id": message_id,
                "attempt": claimed.attempt,
                "step": job.step_order,
            }));
        if let Err(e) = self.db.insert_event(&event).await {
            warn!(job_id = %claimed.id, "Failed to record EMAIL_SENT: {}", e);
        }
        info!(
            campaign_lead_id = %job.campaign_lead_id,
            step = job.step_order,
            message_id = %message_id,
            "Email delivered"
        );
    }

    async fn fail_terminal(
        &self,
        claimed: &ClaimedJob,
        job: &SendEmailJob,
        reason: String,
    ) -> SendOutcome {
        warn!(
            job_id = %claimed.id,
            campaign_lead_id = %job.campaign_lead_id,
            attempt = claimed.attempt,
            "Delivery failed for good: {}", reason
        );

        if let Err(e) = self
            .db
            .finish_campaign_lead(
                job.campaign_lead_id,
                CampaignLeadStatus::Failed,
                Some(&reason),
            )
            .await
        {
            warn!(campaign_lead_id = %job.campaign_lead_id, "Failed to mark campaign lead failed: {}", e);
        }

        let event = Event::new(EventType::EmailFailed, job.lead_id)
            .campaign(job.campaign_id)
            .step(job.sequence_id)
            .metadata(json!({
                "error": reason,
                "attempt": claimed.attempt,
                "step": job.step_order,
            }));
        if let Err(e) = self.db.insert_event(&event).await {
            warn!(job_id = %claimed.id, "Failed to record EMAIL_FAILED: {}", e);
        }

        SendOutcome::Failed { reason }
    }
}
