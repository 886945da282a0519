//! Reply handling: stop sequences for leads that answered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, MailerError};
use crate::outreach::classifier::classify_reply;
use crate::outreach::model::{Event, EventType, Mailbox};
use crate::store::Database;

/// A reply fetched from a mailbox's inbox.
#[derive(Debug, Clone)]
pub struct InboundReply {
    pub from: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Source of replies for a mailbox (an IMAP poller in production).
#[async_trait]
pub trait ReplySource: Send + Sync {
    async fn fetch_replies(&self, mailbox: &Mailbox) -> Result<Vec<InboundReply>, MailerError>;
}

/// Totals from one `handle_replies` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyReport {
    /// Replies whose sender matched at least one lead.
    pub matched: usize,
    /// Campaign-lead rows moved to REPLIED.
    pub rows_replied: usize,
}

/// Apply replies to the store: every active row of a matching lead becomes
/// REPLIED and the lead records the reply's classification.
pub async fn handle_replies(
    db: &dyn Database,
    replies: &[InboundReply],
) -> Result<ReplyReport, DatabaseError> {
    let mut report = ReplyReport::default();

    for reply in replies {
        let address = reply.from.trim();
        let leads = db.find_leads_by_email(address).await?;
        if leads.is_empty() {
            debug!(from = %address, "Reply from unknown sender");
            continue;
        }
        report.matched += 1;
        let classification = classify_reply(&reply.subject, &reply.body);

        for lead in leads {
            let rows = db.mark_lead_rows_replied(lead.id).await?;
            db.mark_lead_replied(lead.id, classification).await?;

            let metadata = json!({
                "from": address,
                "subject": reply.subject,
                "classification": classification.as_str(),
            });
            if rows.is_empty() {
                db.insert_event(
                    &Event::new(EventType::ReplyReceived, lead.id)
                        .at(reply.received_at)
                        .metadata(metadata),
                )
                .await?;
                continue;
            }
            for row in &rows {
                db.insert_event(
                    &Event::new(EventType::ReplyReceived, lead.id)
                        .campaign(row.campaign_id)
                        .at(reply.received_at)
                        .metadata(metadata.clone()),
                )
                .await?;
            }
            report.rows_replied += rows.len();
            info!(
                lead_id = %lead.id,
                rows = rows.len(),
                classification = classification.as_str(),
                "Lead replied"
            );
        }
    }

    Ok(report)
}

/// Fetch and apply replies for every active mailbox.
///
/// A failing mailbox is logged and skipped.
pub async fn poll_replies(
    db: &dyn Database,
    source: &dyn ReplySource,
) -> Result<ReplyReport, DatabaseError> {
    let mut total = ReplyReport::default();
    let mailboxes = db
        .list_mailboxes(Some(crate::outreach::model::MailboxStatus::Active))
        .await?;

    for mailbox in &mailboxes {
        let replies = match source.fetch_replies(mailbox).await {
            Ok(replies) => replies,
            Err(e) => {
                if e.needs_operator() {
                    warn!(mailbox = %mailbox.email, "Reply fetch failed, check mailbox settings: {}", e);
                } else {
                    warn!(mailbox = %mailbox.email, "Reply fetch failed: {}", e);
                }
                continue;
            }
        };
        if replies.is_empty() {
            continue;
        }
        match handle_replies(db, &replies).await {
            Ok(report) => {
                total.matched += report.matched;
                total.rows_replied += report.rows_replied;
            }
            Err(e) => warn!(mailbox = %mailbox.email, "Applying replies failed: {}", e),
        }
    }
    Ok(total)
}
