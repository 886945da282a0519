//! Mailbox warmup: raise daily limits as a mailbox ages.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::WarmupPolicy;
use crate::error::DatabaseError;
use crate::outreach::model::Mailbox;
use crate::store::Database;

/// Daily limit a mailbox created at `created_at` is entitled to at `now`.
pub fn warmup_target(
    policy: &WarmupPolicy,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let days_running = (now - created_at).num_days().max(0);
    policy
        .base_limit
        .saturating_add(days_running.saturating_mul(policy.ramp_per_day))
        .min(policy.max_cap)
}

/// Raise the limit of every warming mailbox that is below its target.
///
/// Never lowers a limit. Returns the number of mailboxes raised.
pub async fn process_warmup(
    db: &dyn Database,
    policy: &WarmupPolicy,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let mailboxes = db.list_warmup_mailboxes().await?;
    let mut raised = 0;
    for mailbox in &mailboxes {
        if raise_one(db, policy, mailbox, now).await? {
            raised += 1;
        }
    }
    if raised > 0 {
        info!(raised, total = mailboxes.len(), "Warmup limits raised");
    }
    Ok(raised)
}

async fn raise_one(
    db: &dyn Database,
    policy: &WarmupPolicy,
    mailbox: &Mailbox,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let target = warmup_target(policy, mailbox.created_at, now);
    if target <= mailbox.daily_limit {
        return Ok(false);
    }
    let raised = db.raise_daily_limit(mailbox.id, target).await?;
    if raised {
        debug!(
            mailbox_id = %mailbox.id,
            from = mailbox.daily_limit,
            to = target,
            "Warmup raised daily limit"
        );
    }
    Ok(raised)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use secrecy::SecretString;

    use super::*;
    use crate::outreach::model::SmtpSettings;
    use crate::store::LibSqlBackend;

    fn warming(limit: i64, age_days: i64, now: DateTime<Utc>) -> Mailbox {
        let mut mailbox = Mailbox::new(
            &format!("m{limit}-{age_days}@example.com"),
            SmtpSettings {
                host: "smtp.example.com".into(),
                port: 587,
                username: "u".into(),
                password: SecretString::from("p".to_string()),
            },
        );
        mailbox.daily_limit = limit;
        mailbox.warmup_enabled = true;
        mailbox.created_at = now - Duration::days(age_days);
        mailbox
    }

    #[test]
    fn target_ramps_then_caps() {
        let policy = WarmupPolicy::default();
        let now = Utc::now();
        assert_eq!(warmup_target(&policy, now, now), 5);
        assert_eq!(warmup_target(&policy, now - Duration::days(10), now), 25);
        assert_eq!(warmup_target(&policy, now - Duration::hours(47), now), 7);
        assert_eq!(warmup_target(&policy, now - Duration::days(400), now), 50);
        // Clock skew never goes below base.
        assert_eq!(warmup_target(&policy, now + Duration::days(2), now), 5);
    }

    #[tokio::test]
    async fn ten_day_old_mailbox_reaches_twenty_five() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let young = warming(5, 10, now);
        let seasoned = warming(40, 10, now);
        db.insert_mailbox(&young).await.unwrap();
        db.insert_mailbox(&seasoned).await.unwrap();

        let policy = WarmupPolicy::default();
        assert_eq!(process_warmup(&db, &policy, now).await.unwrap(), 1);
        assert_eq!(db.get_mailbox(young.id).await.unwrap().unwrap().daily_limit, 25);
        assert_eq!(db.get_mailbox(seasoned.id).await.unwrap().unwrap().daily_limit, 40);

        // Second run is a no-op.
        assert_eq!(process_warmup(&db, &policy, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mailboxes_without_warmup_are_untouched() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let mut plain = warming(5, 30, now);
        plain.warmup_enabled = false;
        db.insert_mailbox(&plain).await.unwrap();

        process_warmup(&db, &WarmupPolicy::default(), now).await.unwrap();
        assert_eq!(db.get_mailbox(plain.id).await.unwrap().unwrap().daily_limit, 5);
    }
}
