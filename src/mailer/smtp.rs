//! SMTP mailer via lettre.
//!
//! lettre's `SmtpTransport` is blocking, so every send runs on the blocking
//! pool. A transport is built per send from the mailbox's own credentials.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox as Sender;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info};
use uuid::Uuid;

use super::tracking::instrument;
use super::{Mailer, OutboundEmail};
use crate::config::TrackingConfig;
use crate::error::MailerError;
use crate::outreach::model::Mailbox;

/// Port on which SMTP servers expect implicit TLS.
const IMPLICIT_TLS_PORT: u16 = 465;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SmtpMailer {
    tracking: TrackingConfig,
}

impl SmtpMailer {
    pub fn new(tracking: TrackingConfig) -> Self {
        Self { tracking }
    }

    fn transport(mailbox: &Mailbox) -> Result<SmtpTransport, MailerError> {
        let smtp = &mailbox.smtp;
        let builder = if smtp.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&smtp.host)
        } else {
            SmtpTransport::starttls_relay(&smtp.host)
        }
        .map_err(|e| MailerError::Connection {
            host: smtp.host.clone(),
            reason: format!("SMTP relay error: {e}"),
        })?;

        let creds = Credentials::new(
            smtp.username.clone(),
            smtp.password.expose_secret().to_string(),
        );
        Ok(builder
            .port(smtp.port)
            .credentials(creds)
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }

    /// Build the MIME message. Returns it with the Message-ID it carries.
    fn build_message(
        &self,
        mailbox: &Mailbox,
        email: &OutboundEmail,
    ) -> Result<(Message, String), MailerError> {
        let from_addr: Address = mailbox
            .email
            .parse()
            .map_err(|e| MailerError::InvalidMessage(format!("Invalid from address: {e}")))?;
        let to_addr: Address = email
            .to
            .trim()
            .parse()
            .map_err(|e| MailerError::Rejected(format!("Invalid to address {:?}: {e}", email.to)))?;

        let message_id = format!("<{}@{}>", Uuid::new_v4(), from_addr.domain());

        let html = match (&self.tracking.base_url, &email.tracking) {
            (Some(base), Some(ids)) => instrument(&email.html, base, ids),
            _ => email.html.clone(),
        };

        let mut builder = Message::builder()
            .from(Sender::new(
                Some(mailbox.display_name().to_string()),
                from_addr,
            ))
            .to(Sender::new(None, to_addr))
            .subject(email.subject.as_str())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML);

        if let Some(reply_to) = email.reply_to.as_deref().filter(|r| !r.trim().is_empty()) {
            let reply_addr: Address = reply_to
                .trim()
                .parse()
                .map_err(|e| MailerError::InvalidMessage(format!("Invalid reply-to address: {e}")))?;
            builder = builder.reply_to(Sender::new(None, reply_addr));
        }

        let message = builder
            .body(html)
            .map_err(|e| MailerError::InvalidMessage(format!("Failed to build email: {e}")))?;
        Ok((message, message_id))
    }
}

/// Map a lettre SMTP error onto the retry/operator taxonomy.
fn classify(mailbox: &Mailbox, e: lettre::transport::smtp::Error) -> MailerError {
    let code = e.status().map(|code| code.to_string());
    if code.as_deref().is_some_and(|c| c == "530" || c == "534" || c == "535") {
        return MailerError::Authentication {
            mailbox: mailbox.email.clone(),
            reason: e.to_string(),
        };
    }
    if e.is_permanent() {
        return MailerError::Rejected(e.to_string());
    }
    if e.is_transient() || e.is_timeout() {
        return MailerError::Transient(e.to_string());
    }
    MailerError::Connection {
        host: mailbox.smtp.host.clone(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mailbox: &Mailbox, email: &OutboundEmail) -> Result<String, MailerError> {
        let (message, message_id) = self.build_message(mailbox, email)?;
        let transport = Self::transport(mailbox)?;

        debug!(from = %mailbox.email, to = %email.to, host = %mailbox.smtp.host, "Sending email");
        let mailbox_for_errors = mailbox.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailerError::Transient(format!("SMTP send task panicked: {e}")))?
            .map_err(|e| classify(&mailbox_for_errors, e))?;

        info!(from = %mailbox.email, to = %email.to, message_id = %message_id, "Email sent");
        Ok(message_id)
    }
}
