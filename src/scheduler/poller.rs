//! Tick and per-candidate dispatch.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde_json::json;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::pacing::{SlotLease, assign_slots, delay_until, pacing_gap};
use super::{Scheduler, TickReport, completion, steps, warmup};
use crate::error::{DatabaseError, Error, QueueError};
use crate::outreach::model::{
    CampaignLeadStatus, Event, EventType, MailboxStatus, SequenceStep, StepType,
};
use crate::queue::{DeliveryJob, SendEmailJob};
use crate::store::Candidate;
use crate::template;

/// What `process_job` did with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Sequence exhausted; row is now IGNORED.
    Ignored,
    /// Condition failed; step skipped and row advanced.
    Skipped,
    /// Non-email step satisfied and row advanced.
    Advanced,
    Queued { job_id: Uuid, run_at: DateTime<Utc> },
    /// Mailbox daily cap reached; row untouched.
    CapReached,
    /// Mailbox missing or not active; row untouched.
    MailboxUnavailable,
    /// Enqueue failed; row is now FAILED.
    Failed,
    /// Row moved on since it was scanned.
    Stale,
}

impl Scheduler {
    /// Run one poll cycle at the current time.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one poll cycle as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match warmup::process_warmup(self.db.as_ref(), &self.warmup, now).await {
            Ok(raised) => report.mailboxes_warmed = raised,
            Err(e) => {
                error!("Warmup step failed: {}", e);
                report.errors += 1;
            }
        }

        match completion::sweep_completions(self.db.as_ref()).await {
            Ok(done) => report.campaigns_completed = done.len(),
            Err(e) => {
                error!("Completion sweep failed: {}", e);
                report.errors += 1;
            }
        }

        if let Err(e) = self.ledger.purge_expired(now).await {
            warn!("Pacing ledger purge failed: {}", e);
        }

        let candidates = match self.db.due_candidates(now, self.config.batch_size).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Candidate scan failed: {}", e);
                report.errors += 1;
                return report;
            }
        };
        report.scanned = candidates.len();

        // Groups keep scan order, both across and within mailboxes.
        let mut order: Vec<Uuid> = Vec::new();
        let mut groups: HashMap<Uuid, Vec<Candidate>> = HashMap::new();

        for candidate in candidates {
            if candidate.row.current_step as usize >= candidate.plan.steps.len() {
                self.record(&mut report, &candidate, Duration::ZERO, now).await;
                continue;
            }

            let window = candidate.plan.campaign.window;
            if let Some(opens_at) = window.next_open(now) {
                match self.defer(&candidate, opens_at).await {
                    Ok(true) => report.deferred += 1,
                    Ok(false) => report.stale += 1,
                    Err(e) => {
                        warn!(campaign_lead_id = %candidate.row.id, "Window deferral failed: {}", e);
                        report.errors += 1;
                    }
                }
                continue;
            }

            let Some(mailbox_id) = candidate.mailbox_id() else {
                warn!(
                    campaign_id = %candidate.row.campaign_id,
                    campaign_lead_id = %candidate.row.id,
                    "Campaign has no mailbox, dropping candidate"
                );
                report.dropped += 1;
                continue;
            };
            groups
                .entry(mailbox_id)
                .or_insert_with(|| {
                    order.push(mailbox_id);
                    Vec::new()
                })
                .push(candidate);
        }

        let runs = order.into_iter().filter_map(|mailbox_id| {
            groups
                .remove(&mailbox_id)
                .map(|group| self.run_group(mailbox_id, group, now))
        });
        for group_report in join_all(runs).await {
            report += group_report;
        }

        report
    }

    /// Push a candidate to the next window opening plus jitter.
    async fn defer(
        &self,
        candidate: &Candidate,
        opens_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let jitter_secs = self.config.window_jitter.as_secs();
        let jitter = rand::thread_rng().gen_range(0..=jitter_secs);
        let next = opens_at + chrono::Duration::seconds(jitter as i64);
        debug!(
            campaign_lead_id = %candidate.row.id,
            next_action_at = %next,
            "Outside send window, deferring"
        );
        self.db
            .reschedule_campaign_lead(candidate.row.id, candidate.row.current_step, next)
            .await
    }

    /// Pace and dispatch one mailbox's candidates in order.
    async fn run_group(
        &self,
        mailbox_id: Uuid,
        group: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> TickReport {
        let mut report = TickReport::default();

        let capped = group
            .first()
            .and_then(|c| c.plan.mailbox.as_ref())
            .is_some_and(|mailbox| !mailbox.has_capacity());

        let gaps: Vec<chrono::Duration> = if capped {
            Vec::new()
        } else {
            let mut rng = rand::thread_rng();
            group
                .iter()
                .filter(|c| needs_slot(c))
                .map(|c| {
                    pacing_gap(
                        &self.config.pacing,
                        c.plan.campaign.pacing_interval_minutes,
                        &mut rng,
                    )
                })
                .collect()
        };

        let slots = if gaps.is_empty() {
            Vec::new()
        } else {
            match self.reserve_slots(mailbox_id, &gaps, now).await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(mailbox_id = %mailbox_id, "Could not reserve send slots, skipping group: {}", e);
                    report.errors += group.len();
                    return report;
                }
            }
        };

        let mut slots = slots.into_iter();
        for candidate in &group {
            let delay = if needs_slot(candidate) && !capped {
                slots
                    .next()
                    .map(|slot| delay_until(slot, now))
                    .unwrap_or(Duration::ZERO)
            } else {
                Duration::ZERO
            };
            self.record(&mut report, candidate, delay, now).await;
        }
        report
    }

    /// Reserve one slot per gap with a compare-and-set on the ledger.
    async fn reserve_slots(
        &self,
        mailbox_id: Uuid,
        gaps: &[chrono::Duration],
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, DatabaseError> {
        let ttl = chrono::Duration::from_std(self.config.ledger_ttl)
            .map_err(|e| DatabaseError::Query(format!("ledger ttl out of range: {e}")))?;

        for attempt in 1..=self.config.ledger_cas_attempts.max(1) {
            let current = self.ledger.get(mailbox_id).await?;
            let anchor = SlotLease::anchor(current.as_ref(), now);
            let (slots, next) = assign_slots(anchor, gaps);
            let lease = SlotLease::new(next, ttl, now);

            if self
                .ledger
                .compare_and_set(mailbox_id, current.as_ref(), &lease)
                .await?
            {
                return Ok(slots);
            }
            debug!(mailbox_id = %mailbox_id, attempt, "Pacing ledger contended, retrying");
        }

        Err(DatabaseError::Constraint(format!(
            "pacing ledger for mailbox {mailbox_id} kept changing"
        )))
    }

    async fn record(
        &self,
        report: &mut TickReport,
        candidate: &Candidate,
        delay: Duration,
        now: DateTime<Utc>,
    ) {
        match self.process_job(candidate, delay, now).await {
            Ok(outcome) => report.record(&outcome),
            Err(e) => {
                warn!(campaign_lead_id = %candidate.row.id, "Processing candidate failed: {}", e);
                report.errors += 1;
            }
        }
    }

    /// Act on one due candidate: finish, skip, advance or enqueue its step.
    ///
    /// `delay` is how long after `now` an email may go out.
    pub async fn process_job(
        &self,
        candidate: &Candidate,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, Error> {
        let row = &candidate.row;
        let plan = &candidate.plan;

        let Some(step) = plan.steps.get(row.current_step as usize) else {
            let finished = self
                .db
                .finish_campaign_lead(row.id, CampaignLeadStatus::Ignored, None)
                .await?;
            return Ok(if finished {
                debug!(campaign_lead_id = %row.id, "Sequence exhausted");
                JobOutcome::Ignored
            } else {
                JobOutcome::Stale
            });
        };

        if !steps::condition_holds(self.db.as_ref(), candidate, step).await? {
            let advance = steps::advance_from(&plan.steps, row.current_step, now, None);
            if !self
                .db
                .advance_campaign_lead(row.id, row.current_step, &advance)
                .await?
            {
                return Ok(JobOutcome::Stale);
            }
            self.db
                .insert_event(
                    &Event::new(EventType::StepSkipped, row.lead_id)
                        .campaign(row.campaign_id)
                        .step(step.id)
                        .at(now)
                        .metadata(json!({
                            "step": step.order,
                            "condition": step.condition.as_str(),
                        })),
                )
                .await?;
            debug!(campaign_lead_id = %row.id, step = step.order, "Step condition failed, skipped");
            return Ok(JobOutcome::Skipped);
        }

        match step.step_type {
            StepType::Email => self.dispatch_email(candidate, step, delay, now).await,
            StepType::Delay => {
                let advance = steps::advance_from(&plan.steps, row.current_step, now, None);
                let moved = self
                    .db
                    .advance_campaign_lead(row.id, row.current_step, &advance)
                    .await?;
                Ok(if moved {
                    JobOutcome::Advanced
                } else {
                    JobOutcome::Stale
                })
            }
        }
    }

    async fn dispatch_email(
        &self,
        candidate: &Candidate,
        step: &SequenceStep,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, Error> {
        let row = &candidate.row;
        let plan = &candidate.plan;

        let Some(mailbox) = plan.mailbox.as_ref() else {
            warn!(campaign_id = %row.campaign_id, "Campaign mailbox no longer exists");
            return Ok(JobOutcome::MailboxUnavailable);
        };
        if mailbox.status != MailboxStatus::Active {
            debug!(mailbox_id = %mailbox.id, status = mailbox.status.as_str(), "Mailbox not active");
            return Ok(JobOutcome::MailboxUnavailable);
        }
        let offset = chrono::Duration::from_std(delay)
            .map_err(|e| QueueError::InvalidJob(format!("send delay out of range: {e}")))?;
        let run_at = now + offset;

        if !self.db.reserve_send(mailbox.id).await? {
            debug!(mailbox_id = %mailbox.id, "Daily limit reached");
            return Ok(JobOutcome::CapReached);
        }

        // Claim the step before enqueueing so a concurrent tick cannot queue it too.
        let advance = steps::advance_from(
            &plan.steps,
            row.current_step,
            now,
            Some(CampaignLeadStatus::Contacted),
        );
        if !self
            .db
            .advance_campaign_lead(row.id, row.current_step, &advance)
            .await?
        {
            self.db.release_send(mailbox.id).await?;
            return Ok(JobOutcome::Stale);
        }

        let vars = candidate.lead.template_vars();
        let (subject, body) = {
            let mut rng = rand::thread_rng();
            (
                template::resolve_with(&step.subject, &vars, &mut rng),
                template::resolve_with(&step.body, &vars, &mut rng),
            )
        };
        let job = DeliveryJob::SendEmail(SendEmailJob {
            campaign_id: row.campaign_id,
            lead_id: row.lead_id,
            campaign_lead_id: row.id,
            sequence_id: step.id,
            step_order: step.order,
            to: Some(candidate.lead.email.clone()),
            subject,
            body,
            mailbox_email: mailbox.email.clone(),
            mailbox_name: Some(mailbox.display_name().to_string()),
            reply_to: None,
        });

        match self.queue.enqueue_at(&job, run_at).await {
            Ok(handle) => {
                self.db
                    .insert_event(
                        &Event::new(EventType::EmailQueued, row.lead_id)
                            .campaign(row.campaign_id)
                            .step(step.id)
                            .at(now)
                            .metadata(json!({
                                "job_id": handle.id.to_string(),
                                "run_at": handle.run_at.to_rfc3339(),
                                "step": step.order,
                            })),
                    )
                    .await?;
                debug!(
                    campaign_lead_id = %row.id,
                    job_id = %handle.id,
                    run_at = %handle.run_at,
                    "Email queued"
                );
                Ok(JobOutcome::Queued {
                    job_id: handle.id,
                    run_at: handle.run_at,
                })
            }
            Err(e) => {
                let reason = format!("enqueue failed: {e}");
                warn!(campaign_lead_id = %row.id, "{}", reason);
                self.db.release_send(mailbox.id).await?;
                self.db
                    .finish_campaign_lead(row.id, CampaignLeadStatus::Failed, Some(&reason))
                    .await?;
                self.db
                    .insert_event(
                        &Event::new(EventType::EmailFailed, row.lead_id)
                            .campaign(row.campaign_id)
                            .step(step.id)
                            .at(now)
                            .metadata(json!({ "error": reason })),
                    )
                    .await?;
                Ok(JobOutcome::Failed)
            }
        }
    }
}

/// Only email steps consume a send slot.
fn needs_slot(candidate: &Candidate) -> bool {
    candidate
        .plan
        .steps
        .get(candidate.row.current_step as usize)
        .is_some_and(|step| step.step_type == StepType::Email)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, TimeZone};
    use secrecy::SecretString;

    use super::*;
    use crate::config::{PacingPolicy, QueueConfig, SchedulerConfig, WarmupPolicy};
    use crate::outreach::model::{
        Campaign, CampaignLead, CampaignStatus, Lead, LeadStatus, Mailbox, ReplyClassification,
        SmtpSettings, StepCondition,
    };
    use crate::queue::DeliveryQueue;
    use crate::scheduler::pacing::MemoryPacingLedger;
    use crate::store::{Database, LibSqlBackend, LibSqlQueue};

    struct Fixture {
        db: Arc<LibSqlBackend>,
        queue: Arc<LibSqlQueue>,
        scheduler: Scheduler,
        mailbox: Mailbox,
        campaign: Campaign,
    }

    async fn fixture(config: SchedulerConfig) -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(db.delivery_queue(QueueConfig::default()));
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
        let mut campaign = Campaign::new("ws", "c").with_mailbox(mailbox.id);
        campaign.status = CampaignStatus::Active;
        db.insert_campaign(&campaign).await.unwrap();

        let scheduler = Scheduler::new(
            db.clone(),
            Arc::new(MemoryPacingLedger::new()),
            queue.clone(),
            config,
            WarmupPolicy::default(),
        );
        Fixture {
            db,
            queue,
            scheduler,
            mailbox,
            campaign,
        }
    }

    async fn add_lead(f: &Fixture, email: &str, at: DateTime<Utc>) -> CampaignLead {
        let lead = Lead::new("ws", email);
        f.db.insert_lead(&lead).await.unwrap();
        let row = CampaignLead::new(f.campaign.id, lead.id, at);
        f.db.insert_campaign_lead(&row).await.unwrap();
        row
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn slots_are_spaced_by_pacing_interval() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 0, "Hi", "b"))
            .await
            .unwrap();
        for i in 0..3 {
            add_lead(&f, &format!("l{i}@x.io"), t0() - ChronoDuration::minutes(3 - i))
                .await;
        }

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.queued, 3);

        let claimed = f
            .queue
            .claim("w", 10, t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        let mut run_ats = Vec::new();
        for job in &claimed {
            run_ats.push(f.queue.get_job(job.id).await.unwrap().unwrap().run_at);
        }
        run_ats.sort();
        assert_eq!(
            run_ats,
            vec![
                t0(),
                t0() + ChronoDuration::minutes(5),
                t0() + ChronoDuration::minutes(10)
            ]
        );
    }

    #[tokio::test]
    async fn second_tick_continues_after_first_ticks_slots() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 0, "Hi", "b"))
            .await
            .unwrap();
        add_lead(&f, "a@x.io", t0()).await;
        f.scheduler.tick_at(t0()).await;

        add_lead(&f, "b@x.io", t0()).await;
        let report = f.scheduler.tick_at(t0() + ChronoDuration::seconds(30)).await;
        assert_eq!(report.queued, 1);

        let claimed = f
            .queue
            .claim("w", 10, t0() + ChronoDuration::hours(1))
            .await
            .unwrap();
        let mut run_ats = Vec::new();
        for job in &claimed {
            run_ats.push(f.queue.get_job(job.id).await.unwrap().unwrap().run_at);
        }
        run_ats.sort();
        assert_eq!(run_ats[1], t0() + ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn if_clicked_step_skipped_without_click() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(
            &SequenceStep::email(f.campaign.id, 0, "Hi", "b")
                .with_condition(StepCondition::IfClicked),
        )
        .await
        .unwrap();
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 1, "Next", "b").with_delay(1, 0))
            .await
            .unwrap();
        let row = add_lead(&f, "a@x.io", t0()).await;

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.queued, 0);

        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 1);
        assert_eq!(stored.status, CampaignLeadStatus::New);
        assert_eq!(stored.next_action_at, Some(t0() + ChronoDuration::days(1)));
        assert!(f
            .db
            .has_event(f.campaign.id, row.lead_id, EventType::StepSkipped)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delay_step_advances_without_sending() {
        let f = fixture(SchedulerConfig::default()).await;
        let mut wait = SequenceStep::email(f.campaign.id, 0, "unused", "");
        wait.step_type = StepType::Delay;
        f.db.insert_step(&wait).await.unwrap();
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 1, "Hi", "b").with_delay(0, 2))
            .await
            .unwrap();
        let row = add_lead(&f, "a@x.io", t0()).await;

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.advanced, 1);
        assert_eq!(f.queue.depth().await.unwrap().queued, 0);
        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 1);
        assert_eq!(stored.next_action_at, Some(t0() + ChronoDuration::hours(2)));
    }

    #[tokio::test]
    async fn campaign_without_mailbox_is_dropped() {
        let f = fixture(SchedulerConfig::default()).await;
        let mut orphan = Campaign::new("ws", "orphan");
        orphan.status = CampaignStatus::Active;
        f.db.insert_campaign(&orphan).await.unwrap();
        f.db.insert_step(&SequenceStep::email(orphan.id, 0, "Hi", "b"))
            .await
            .unwrap();
        let lead = Lead::new("ws", "a@x.io");
        f.db.insert_lead(&lead).await.unwrap();
        let row = CampaignLead::new(orphan.id, lead.id, t0());
        f.db.insert_campaign_lead(&row).await.unwrap();

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.dropped, 1);
        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 0);
        assert_eq!(stored.status, CampaignLeadStatus::New);
        assert_eq!(stored.next_action_at, row.next_action_at);
    }

    #[tokio::test]
    async fn paused_mailbox_leaves_row_untouched() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 0, "Hi", "b"))
            .await
            .unwrap();
        f.db.conn()
            .execute(
                "UPDATE mailboxes SET status = 'paused' WHERE id = ?1",
                libsql::params![f.mailbox.id.to_string()],
            )
            .await
            .unwrap();
        let row = add_lead(&f, "a@x.io", t0()).await;

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.mailbox_unavailable, 1);
        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 0);
        assert_eq!(stored.status, CampaignLeadStatus::New);
    }

    #[tokio::test]
    async fn randomized_pacing_spaces_slots_within_bounds() {
        let config = SchedulerConfig {
            pacing: PacingPolicy::Randomized {
                min: Duration::from_secs(120),
                max: Duration::from_secs(300),
            },
            ..SchedulerConfig::default()
        };
        let f = fixture(config).await;
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 0, "Hi", "b"))
            .await
            .unwrap();
        for i in 0..5 {
            add_lead(&f, &format!("l{i}@x.io"), t0() - ChronoDuration::minutes(5 - i))
                .await;
        }

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.queued, 5);

        let claimed = f
            .queue
            .claim("w", 10, t0() + ChronoDuration::days(1))
            .await
            .unwrap();
        let mut run_ats = Vec::new();
        for job in &claimed {
            run_ats.push(f.queue.get_job(job.id).await.unwrap().unwrap().run_at);
        }
        run_ats.sort();
        assert_eq!(run_ats.len(), 5);
        assert_eq!(run_ats[0], t0());
        for pair in run_ats.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= ChronoDuration::minutes(2) && gap <= ChronoDuration::minutes(5),
                "gap {gap} outside [2m, 5m]"
            );
        }
    }

    #[tokio::test]
    async fn if_no_reply_step_skipped_for_replied_lead() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(
            &SequenceStep::email(f.campaign.id, 0, "Bump", "b")
                .with_condition(StepCondition::IfNoReply),
        )
        .await
        .unwrap();
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 1, "Last", "b").with_delay(2, 0))
            .await
            .unwrap();
        let row = add_lead(&f, "a@x.io", t0()).await;
        f.db.mark_lead_replied(row.lead_id, ReplyClassification::Info)
            .await
            .unwrap();
        assert_eq!(
            f.db.get_lead(row.lead_id).await.unwrap().unwrap().status,
            LeadStatus::Replied
        );

        let report = f.scheduler.tick_at(t0()).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.queued, 0);
        assert_eq!(f.queue.depth().await.unwrap().queued, 0);

        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 1);
        assert_eq!(stored.next_action_at, Some(t0() + ChronoDuration::days(2)));
        assert!(f
            .db
            .has_event(f.campaign.id, row.lead_id, EventType::StepSkipped)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn out_of_range_delay_is_rejected_before_reserving() {
        let f = fixture(SchedulerConfig::default()).await;
        f.db.insert_step(&SequenceStep::email(f.campaign.id, 0, "Hi", "b"))
            .await
            .unwrap();
        let row = add_lead(&f, "a@x.io", t0()).await;
        let candidate = f.db.due_candidates(t0(), 10).await.unwrap().remove(0);

        let result = f.scheduler.process_job(&candidate, Duration::MAX, t0()).await;
        assert!(matches!(result, Err(Error::Queue(QueueError::InvalidJob(_)))));

        let stored = f.db.get_campaign_lead(row.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step, 0);
        assert_eq!(stored.status, CampaignLeadStatus::New);
        assert_eq!(
            f.db.get_mailbox(f.mailbox.id).await.unwrap().unwrap().sent_count,
            0
        );
        assert_eq!(f.queue.depth().await.unwrap().queued, 0);
    }
}
