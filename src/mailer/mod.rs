//! Outbound mail: the `Mailer` seam, an SMTP implementation and tracking
//! instrumentation.

pub mod smtp;
pub mod tracking;

use async_trait::async_trait;

use crate::error::MailerError;
use crate::outreach::model::Mailbox;

pub use smtp::SmtpMailer;
pub use tracking::TrackingIds;

/// One message to send from a mailbox.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub reply_to: Option<String>,
    /// Present when opens and clicks should be tracked.
    pub tracking: Option<TrackingIds>,
}

/// Sends mail on behalf of a mailbox and returns the provider message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mailbox: &Mailbox, email: &OutboundEmail) -> Result<String, MailerError>;
}
