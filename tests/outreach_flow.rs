//! End-to-end flows through the scheduler, the delivery queue and the
//! send worker, against an in-memory libSQL store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use outreach_engine::config::{QueueConfig, SchedulerConfig, WarmupPolicy, WorkerConfig};
use outreach_engine::error::MailerError;
use outreach_engine::mailer::{Mailer, OutboundEmail};
use outreach_engine::outreach::{
    Campaign, CampaignLead, CampaignLeadStatus, CampaignService, CampaignStatus, EventType, Lead,
    LeadStatus, Mailbox, SendWindow, SequenceStep, SmtpSettings, StepCondition,
};
use outreach_engine::queue::{DeliveryQueue, JobStatus};
use outreach_engine::scheduler::{InboundReply, ReplySource, Scheduler};
use outreach_engine::store::{Database, LibSqlBackend, LibSqlQueue};
use outreach_engine::worker::{DeliveryWorkerPool, SendWorker};

// ── Stubs ───────────────────────────────────────────────────────────

/// Records every message; fails with a transient error while `failing` is set.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
    failing: Mutex<bool>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _: &Mailbox, email: &OutboundEmail) -> Result<String, MailerError> {
        if *self.failing.lock().unwrap() {
            return Err(MailerError::Transient("421 service not available".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(format!("<{}@example.com>", Uuid::new_v4()))
    }
}

struct CannedReplies(Vec<InboundReply>);

#[async_trait]
impl ReplySource for CannedReplies {
    async fn fetch_replies(&self, _: &Mailbox) -> Result<Vec<InboundReply>, MailerError> {
        Ok(self.0.clone())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Engine {
    db: Arc<LibSqlBackend>,
    queue: Arc<LibSqlQueue>,
    scheduler: Scheduler,
    pool: DeliveryWorkerPool,
    mailer: Arc<RecordingMailer>,
    service: CampaignService,
    mailbox: Mailbox,
}

impl Engine {
    async fn new() -> Self {
        Self::with_mailbox(smtp_mailbox()).await
    }

    async fn with_mailbox(mailbox: Mailbox) -> Self {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(db.delivery_queue(QueueConfig::default()));
        let scheduler = Scheduler::new(
            db.clone(),
            db.clone(),
            queue.clone(),
            SchedulerConfig::default(),
            WarmupPolicy::default(),
        );
        let mailer = Arc::new(RecordingMailer::default());
        let pool = DeliveryWorkerPool::new(
            queue.clone(),
            SendWorker::new(db.clone(), mailer.clone()),
            WorkerConfig {
                worker_id: "test-worker".into(),
                sends_per_second: 1000,
                ..WorkerConfig::default()
            },
        );
        let service = CampaignService::new(db.clone());
        let mailbox = service.create_mailbox(mailbox).await.unwrap();
        Self {
            db,
            queue,
            scheduler,
            pool,
            mailer,
            service,
            mailbox,
        }
    }

    async fn campaign(&self, window: SendWindow, steps: Vec<(u32, u32, StepCondition)>) -> Campaign {
        let campaign = self
            .service
            .create_campaign(
                Campaign::new("ws", "Q4 outreach")
                    .with_mailbox(self.mailbox.id)
                    .with_window(window),
            )
            .await
            .unwrap();
        for (order, (days, hours, condition)) in steps.into_iter().enumerate() {
            let step = SequenceStep::email(
                campaign.id,
                order as u32,
                "Hi {{firstName}}",
                "<p>Step {{step}} for {{company}}</p>",
            )
            .with_delay(days, hours)
            .with_condition(condition);
            self.service.add_step(step).await.unwrap();
        }
        self.service.activate(campaign.id).await.unwrap();
        campaign
    }

    async fn enroll(&self, campaign: &Campaign, email: &str, at: DateTime<Utc>) -> CampaignLead {
        let mut lead = Lead::new("ws", email);
        lead.first_name = Some("Ada".into());
        lead.company = Some("Initech".into());
        let lead = self.service.create_lead(lead).await.unwrap();
        let row = CampaignLead::new(campaign.id, lead.id, at);
        self.db.insert_campaign_lead(&row).await.unwrap();
        row
    }

    async fn row(&self, row: &CampaignLead) -> CampaignLead {
        self.db.get_campaign_lead(row.id).await.unwrap().unwrap()
    }

    async fn count_events(&self, row: &CampaignLead, event_type: EventType) -> usize {
        self.db
            .list_events(row.lead_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type && e.campaign_id == Some(row.campaign_id))
            .count()
    }

    async fn sent_count(&self) -> i64 {
        self.db
            .get_mailbox(self.mailbox.id)
            .await
            .unwrap()
            .unwrap()
            .sent_count
    }
}

fn smtp_mailbox() -> Mailbox {
    Mailbox::new(
        "sales@example.com",
        SmtpSettings {
            host: "smtp.example.com".into(),
            port: 587,
            username: "sales".into(),
            password: SecretString::from("hunter2".to_string()),
        },
    )
}

fn new_york_9_to_5() -> SendWindow {
    SendWindow::from_parts(Some("America/New_York"), Some("09:00"), Some("17:00")).unwrap()
}

/// 10:00 in New York.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 10, 27, 14, 0, 0).unwrap()
}

// ── Flows ───────────────────────────────────────────────────────────

#[tokio::test]
async fn first_step_is_queued_once_then_delivered() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(
            SendWindow::Unbounded,
            vec![(0, 0, StepCondition::Always), (3, 0, StepCondition::Always)],
        )
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;

    let report = engine.scheduler.tick_at(t0()).await;
    assert_eq!(report.queued, 1);
    assert_eq!(engine.sent_count().await, 1);

    let after_tick = engine.row(&row).await;
    assert_eq!(after_tick.status, CampaignLeadStatus::Contacted);
    assert_eq!(after_tick.current_step, 1);
    assert_eq!(after_tick.next_action_at, Some(t0() + Duration::days(3)));
    assert_eq!(engine.count_events(&row, EventType::EmailQueued).await, 1);

    // A second tick at the same instant has nothing due.
    let again = engine.scheduler.tick_at(t0()).await;
    assert_eq!(again.queued, 0);
    assert_eq!(engine.sent_count().await, 1);

    let delivered = engine.pool.run_once_at(t0()).await.unwrap();
    assert_eq!(delivered.sent, 1);

    let sent = engine.mailer.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ada@initech.com");
    assert_eq!(sent[0].subject, "Hi Ada");
    assert!(sent[0].html.contains("Initech"));

    let after_send = engine.row(&row).await;
    assert_eq!(after_send.status, CampaignLeadStatus::Sent);
    assert_eq!(after_send.current_step, 1);
    assert_eq!(after_send.next_action_at, Some(t0() + Duration::days(3)));
    assert_eq!(engine.count_events(&row, EventType::EmailSent).await, 1);
    assert_eq!(engine.sent_count().await, 1);
}

#[tokio::test]
async fn inside_window_sends_immediately() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(new_york_9_to_5(), vec![(0, 0, StepCondition::Always)])
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;

    let report = engine.scheduler.tick_at(t0()).await;
    assert_eq!(report.deferred, 0);
    assert_eq!(report.queued, 1);
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Contacted);
}

#[tokio::test]
async fn outside_window_defers_to_next_opening() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(new_york_9_to_5(), vec![(0, 0, StepCondition::Always)])
        .await;
    // 18:00 in New York.
    let evening = Utc.with_ymd_and_hms(2023, 10, 27, 22, 0, 0).unwrap();
    let row = engine.enroll(&campaign, "ada@initech.com", evening).await;

    let report = engine.scheduler.tick_at(evening).await;
    assert_eq!(report.deferred, 1);
    assert_eq!(report.queued, 0);
    assert_eq!(engine.sent_count().await, 0);

    let deferred = engine.row(&row).await;
    let opening = Utc.with_ymd_and_hms(2023, 10, 28, 13, 0, 0).unwrap();
    let next = deferred.next_action_at.unwrap();
    assert!(next >= opening, "{next} is before the window opens");
    assert!(next <= opening + Duration::minutes(5), "{next} has too much jitter");
    assert_eq!(deferred.current_step, 0);
    assert_eq!(deferred.status, CampaignLeadStatus::New);
    assert_eq!(engine.count_events(&row, EventType::EmailQueued).await, 0);
}

#[tokio::test]
async fn opened_lead_skips_if_no_open_step() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(
            SendWindow::Unbounded,
            vec![
                (0, 0, StepCondition::Always),
                (2, 0, StepCondition::IfNoOpen),
                (0, 0, StepCondition::Always),
            ],
        )
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;
    let steps = engine.db.list_steps(campaign.id).await.unwrap();

    engine.scheduler.tick_at(t0()).await;
    engine
        .service
        .record_engagement(row.id, Some(steps[0].id), EventType::EmailOpened, serde_json::json!({}))
        .await
        .unwrap();

    let later = t0() + Duration::days(2);
    let report = engine.scheduler.tick_at(later).await;
    assert_eq!(report.skipped, 1);
    let skipped = engine.row(&row).await;
    assert_eq!(skipped.current_step, 2);
    assert_eq!(skipped.next_action_at, Some(later));
    assert_eq!(engine.count_events(&row, EventType::StepSkipped).await, 1);

    let report = engine.scheduler.tick_at(later).await;
    assert_eq!(report.queued, 1);

    let queued_steps: Vec<Option<Uuid>> = engine
        .db
        .list_events(row.lead_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::EmailQueued)
        .map(|e| e.sequence_id)
        .collect();
    assert_eq!(queued_steps, vec![Some(steps[0].id), Some(steps[2].id)]);
}

#[tokio::test]
async fn daily_cap_holds_back_extra_leads() {
    let mut mailbox = smtp_mailbox();
    mailbox.daily_limit = 1;
    let engine = Engine::with_mailbox(mailbox).await;
    let campaign = engine
        .campaign(SendWindow::Unbounded, vec![(0, 0, StepCondition::Always)])
        .await;
    let first = engine.enroll(&campaign, "ada@initech.com", t0()).await;
    let second = engine.enroll(&campaign, "bob@initech.com", t0() + Duration::seconds(1)).await;

    let report = engine.scheduler.tick_at(t0() + Duration::seconds(1)).await;
    assert_eq!(report.queued, 1);
    assert_eq!(report.cap_reached, 1);
    assert_eq!(engine.sent_count().await, 1);

    assert_eq!(engine.count_events(&first, EventType::EmailQueued).await, 1);
    assert_eq!(engine.count_events(&second, EventType::EmailQueued).await, 0);
    let held = engine.row(&second).await;
    assert_eq!(held.status, CampaignLeadStatus::New);
    assert_eq!(held.current_step, 0);
}

#[tokio::test]
async fn finished_campaign_completes_once() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(SendWindow::Unbounded, vec![(0, 0, StepCondition::Always)])
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;

    let first = engine.scheduler.tick_at(t0()).await;
    assert_eq!(first.queued, 1);
    assert_eq!(first.campaigns_completed, 0);
    engine.pool.run_once_at(t0()).await.unwrap();
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Sent);

    // The exhausted row is finished before the campaign may complete.
    let second = engine.scheduler.tick_at(t0() + Duration::minutes(1)).await;
    assert_eq!(second.ignored, 1);
    assert_eq!(second.campaigns_completed, 0);
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Ignored);

    let third = engine.scheduler.tick_at(t0() + Duration::minutes(2)).await;
    assert_eq!(third.campaigns_completed, 1);
    let stored = engine.db.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);

    let fourth = engine.scheduler.tick_at(t0() + Duration::minutes(3)).await;
    assert_eq!(fourth.campaigns_completed, 0);
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Ignored);
}

#[tokio::test]
async fn queued_last_step_is_ignored_before_delivery_completes_campaign() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(SendWindow::Unbounded, vec![(0, 0, StepCondition::Always)])
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;

    engine.scheduler.tick_at(t0()).await;
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Contacted);

    for minute in 1..=3 {
        engine.scheduler.tick_at(t0() + Duration::minutes(minute)).await;
    }
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Ignored);
    let stored = engine.db.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn warmup_ramps_daily_limit() {
    let mut mailbox = smtp_mailbox();
    mailbox.warmup_enabled = true;
    mailbox.daily_limit = 5;
    mailbox.created_at = t0() - Duration::days(10);
    let engine = Engine::with_mailbox(mailbox).await;

    let report = engine.scheduler.tick_at(t0()).await;
    assert_eq!(report.mailboxes_warmed, 1);
    let stored = engine.db.get_mailbox(engine.mailbox.id).await.unwrap().unwrap();
    assert_eq!(stored.daily_limit, 25);

    let again = engine.scheduler.tick_at(t0()).await;
    assert_eq!(again.mailboxes_warmed, 0);
}

#[tokio::test]
async fn reply_stops_the_sequence() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(
            SendWindow::Unbounded,
            vec![(0, 0, StepCondition::Always), (3, 0, StepCondition::Always)],
        )
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;

    engine.scheduler.tick_at(t0()).await;
    engine.pool.run_once_at(t0()).await.unwrap();

    let source = CannedReplies(vec![InboundReply {
        from: "Ada@Initech.com".into(),
        subject: "Re: Hi Ada".into(),
        body: "Sounds interesting, can we schedule a call next week?".into(),
        received_at: t0() + Duration::hours(2),
    }]);
    let replies = engine.scheduler.poll_replies(&source).await;
    assert_eq!(replies.matched, 1);
    assert_eq!(replies.rows_replied, 1);

    let replied = engine.row(&row).await;
    assert_eq!(replied.status, CampaignLeadStatus::Replied);
    let lead = engine.db.get_lead(row.lead_id).await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Replied);
    assert!(lead.classification.is_some());
    assert_eq!(engine.count_events(&row, EventType::ReplyReceived).await, 1);

    let report = engine.scheduler.tick_at(t0() + Duration::days(4)).await;
    assert_eq!(report.queued, 0);
    assert_eq!(engine.mailer.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_retries_then_fail_the_lead() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(SendWindow::Unbounded, vec![(0, 0, StepCondition::Always)])
        .await;
    let row = engine.enroll(&campaign, "ada@initech.com", t0()).await;
    *engine.mailer.failing.lock().unwrap() = true;

    engine.scheduler.tick_at(t0()).await;

    let first = engine.pool.run_once_at(t0()).await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(engine.row(&row).await.status, CampaignLeadStatus::Contacted);

    let second = engine.pool.run_once_at(t0() + Duration::seconds(10)).await.unwrap();
    assert_eq!(second.retried, 1);

    let third = engine.pool.run_once_at(t0() + Duration::seconds(30)).await.unwrap();
    assert_eq!(third.failed, 1);

    let failed = engine.row(&row).await;
    assert_eq!(failed.status, CampaignLeadStatus::Failed);
    assert!(failed.failure_reason.unwrap().contains("421"));
    assert_eq!(engine.count_events(&row, EventType::EmailFailed).await, 1);
    assert_eq!(engine.count_events(&row, EventType::EmailSent).await, 0);

    let depth = engine.queue.depth().await.unwrap();
    assert_eq!(depth.failed, 1);
    assert_eq!(depth.pending(), 0);
}

#[tokio::test]
async fn slots_stay_monotonic_across_scheduler_instances() {
    let engine = Engine::new().await;
    let campaign = engine
        .campaign(SendWindow::Unbounded, vec![(0, 0, StepCondition::Always)])
        .await;
    for i in 0..3 {
        engine
            .enroll(&campaign, &format!("lead{i}@initech.com"), t0())
            .await;
    }
    engine.scheduler.tick_at(t0()).await;

    // A second scheduler sharing the database ledger picks up where the first stopped.
    let other = Scheduler::new(
        engine.db.clone(),
        engine.db.clone(),
        engine.queue.clone(),
        SchedulerConfig::default(),
        WarmupPolicy::default(),
    );
    let later = t0() + Duration::minutes(1);
    for i in 3..5 {
        engine
            .enroll(&campaign, &format!("lead{i}@initech.com"), later)
            .await;
    }
    let report = other.tick_at(later).await;
    assert_eq!(report.queued, 2);

    let mut run_ats = Vec::new();
    for row in engine.db.list_campaign_leads(campaign.id).await.unwrap() {
        for event in engine.db.list_events(row.lead_id).await.unwrap() {
            if event.event_type == EventType::EmailQueued {
                let run_at = event.metadata["run_at"].as_str().unwrap();
                run_ats.push(DateTime::parse_from_rfc3339(run_at).unwrap().with_timezone(&Utc));
            }
        }
    }
    run_ats.sort();
    let expected: Vec<DateTime<Utc>> = (0..5).map(|i| t0() + Duration::minutes(5 * i)).collect();
    assert_eq!(run_ats, expected);

    // Jobs become visible in slot order.
    let due = engine
        .queue
        .claim("probe", 10, t0() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(due.len(), 3);
}

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("outreach.db");

    let mailbox_id = {
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let mailbox = smtp_mailbox();
        db.insert_mailbox(&mailbox).await.unwrap();
        let queue = db.delivery_queue(QueueConfig::default());
        let job = outreach_engine::queue::DeliveryJob::SendEmail(
            outreach_engine::queue::SendEmailJob {
                campaign_id: Uuid::new_v4(),
                lead_id: Uuid::new_v4(),
                campaign_lead_id: Uuid::new_v4(),
                sequence_id: Uuid::new_v4(),
                step_order: 0,
                to: Some("ada@initech.com".into()),
                subject: "Hi".into(),
                body: "b".into(),
                mailbox_email: mailbox.email.clone(),
                mailbox_name: None,
                reply_to: None,
            },
        );
        queue.enqueue_at(&job, t0()).await.unwrap();
        mailbox.id
    };

    // Reopening runs migrations again without touching existing data.
    let db = LibSqlBackend::new_local(&path).await.unwrap();
    let mailbox = db.get_mailbox(mailbox_id).await.unwrap().unwrap();
    assert_eq!(mailbox.email, "sales@example.com");

    let queue = db.delivery_queue(QueueConfig::default());
    let claimed = queue.claim("w", 5, t0()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let record = queue.get_job(claimed[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Running);
}
