//! Delivery job payloads.
//!
//! Jobs are a closed set of variants tagged by `job_type`. Payloads are
//! validated when they enter the queue and again when they are claimed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// A unit of work carried by the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum DeliveryJob {
    SendEmail(SendEmailJob),
}

/// Send one resolved sequence step to one lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEmailJob {
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub campaign_lead_id: Uuid,
    pub sequence_id: Uuid,
    /// Index of the step being sent.
    pub step_order: u32,
    /// Recipient address; looked up from the lead when absent.
    #[serde(default)]
    pub to: Option<String>,
    pub subject: String,
    pub body: String,
    pub mailbox_email: String,
    #[serde(default)]
    pub mailbox_name: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl DeliveryJob {
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "send_email",
        }
    }

    /// Reject payloads a worker could never act on.
    pub fn validate(&self) -> Result<(), QueueError> {
        match self {
            Self::SendEmail(job) => {
                if !job.mailbox_email.contains('@') {
                    return Err(QueueError::InvalidJob(format!(
                        "sender mailbox {:?} is not an address",
                        job.mailbox_email
                    )));
                }
                if job.subject.trim().is_empty() {
                    return Err(QueueError::InvalidJob("subject is empty".into()));
                }
                if let Some(to) = &job.to {
                    if !to.contains('@') {
                        return Err(QueueError::InvalidJob(format!(
                            "recipient {to:?} is not an address"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    pub fn to_payload(&self) -> Result<String, QueueError> {
        self.validate()?;
        serde_json::to_string(self).map_err(|e| QueueError::InvalidJob(e.to_string()))
    }

    pub fn from_payload(payload: &str) -> Result<Self, QueueError> {
        let job: Self =
            serde_json::from_str(payload).map_err(|e| QueueError::InvalidJob(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SendEmailJob {
        SendEmailJob {
            campaign_id: Uuid::new_v4(),
            lead_id: Uuid::new_v4(),
            campaign_lead_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            step_order: 0,
            to: Some("lead@example.com".into()),
            subject: "Hello".into(),
            body: "<p>Hi</p>".into(),
            mailbox_email: "sales@example.com".into(),
            mailbox_name: Some("Sales".into()),
            reply_to: None,
        }
    }

    #[test]
    fn payload_is_tagged() {
        let job = DeliveryJob::SendEmail(sample());
        let payload = job.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["job_type"], "send_email");
        assert_eq!(DeliveryJob::from_payload(&payload).unwrap(), job);
    }

    #[test]
    fn rejects_unknown_job_type() {
        let err = DeliveryJob::from_payload(r#"{"job_type":"launch_rockets"}"#).unwrap_err();
        assert!(matches!(err, QueueError::InvalidJob(_)));
    }

    #[test]
    fn rejects_bad_sender() {
        let mut job = sample();
        job.mailbox_email = "nobody".into();
        assert!(DeliveryJob::SendEmail(job).validate().is_err());
    }

    #[test]
    fn recipient_is_optional() {
        let mut job = sample();
        job.to = None;
        assert!(DeliveryJob::SendEmail(job).validate().is_ok());
    }
}
