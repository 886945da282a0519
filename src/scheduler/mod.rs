//! The scheduler: a poll cycle that turns due campaign-lead rows into paced
//! delivery jobs.
//!
//! Each tick advances warmup, sweeps finished campaigns, defers rows that
//! fall outside their send window, paces the rest per mailbox through the
//! shared ledger and dispatches them one by one. Failures are isolated per
//! candidate and per mailbox group; a tick never errors out.

pub mod completion;
pub mod pacing;
mod poller;
pub mod replies;
pub mod steps;
pub mod warmup;

use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, WarmupPolicy};
use crate::queue::DeliveryQueue;
use crate::store::Database;

pub use pacing::{MemoryPacingLedger, PacingLedger, SlotLease};
pub use poller::JobOutcome;
pub use replies::{InboundReply, ReplyReport, ReplySource};

/// Counters from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub mailboxes_warmed: usize,
    pub campaigns_completed: usize,
    pub scanned: usize,
    /// Rescheduled to the next window opening.
    pub deferred: usize,
    /// Campaign has no mailbox.
    pub dropped: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub advanced: usize,
    pub queued: usize,
    pub cap_reached: usize,
    pub mailbox_unavailable: usize,
    pub failed: usize,
    /// Row changed under us.
    pub stale: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Ignored => self.ignored += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Advanced => self.advanced += 1,
            JobOutcome::Queued { .. } => self.queued += 1,
            JobOutcome::CapReached => self.cap_reached += 1,
            JobOutcome::MailboxUnavailable => self.mailbox_unavailable += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Stale => self.stale += 1,
        }
    }
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.mailboxes_warmed += other.mailboxes_warmed;
        self.campaigns_completed += other.campaigns_completed;
        self.scanned += other.scanned;
        self.deferred += other.deferred;
        self.dropped += other.dropped;
        self.ignored += other.ignored;
        self.skipped += other.skipped;
        self.advanced += other.advanced;
        self.queued += other.queued;
        self.cap_reached += other.cap_reached;
        self.mailbox_unavailable += other.mailbox_unavailable;
        self.failed += other.failed;
        self.stale += other.stale;
        self.errors += other.errors;
    }
}

/// The outreach scheduler. Dependencies are injected; one per process.
pub struct Scheduler {
    db: Arc<dyn Database>,
    ledger: Arc<dyn PacingLedger>,
    queue: Arc<dyn DeliveryQueue>,
    config: SchedulerConfig,
    warmup: WarmupPolicy,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        ledger: Arc<dyn PacingLedger>,
        queue: Arc<dyn DeliveryQueue>,
        config: SchedulerConfig,
        warmup: WarmupPolicy,
    ) -> Self {
        Self {
            db,
            ledger,
            queue,
            config,
            warmup,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Fetch and apply replies for all active mailboxes.
    pub async fn poll_replies(&self, source: &dyn ReplySource) -> ReplyReport {
        match replies::poll_replies(self.db.as_ref(), source).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Reply poll failed: {}", e);
                ReplyReport::default()
            }
        }
    }
}

/// Spawn the external timer that drives `Scheduler::tick`.
///
/// Ticks are serialized: a slow tick delays the next one instead of
/// overlapping it.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let period = scheduler.config.tick_interval;
        info!("Scheduler started — ticking every {}s", period.as_secs());

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            let report = scheduler.tick().await;
            if report.scanned > 0 || report.campaigns_completed > 0 {
                info!(
                    scanned = report.scanned,
                    queued = report.queued,
                    deferred = report.deferred,
                    skipped = report.skipped,
                    ignored = report.ignored,
                    cap_reached = report.cap_reached,
                    failed = report.failed,
                    errors = report.errors,
                    completed = report.campaigns_completed,
                    "Tick finished"
                );
            } else {
                debug!("Tick finished with nothing due");
            }
        }
    });

    (handle, shutdown_flag)
}

/// Spawn the periodic reply poll.
pub fn spawn_reply_poller(
    scheduler: Arc<Scheduler>,
    source: Arc<dyn ReplySource>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let period = scheduler.config.reply_poll_interval;
        info!("Reply poller started — polling every {}s", period.as_secs());

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Reply poller shutting down");
                return;
            }

            let report = scheduler.poll_replies(source.as_ref()).await;
            if report.matched > 0 {
                info!(
                    matched = report.matched,
                    rows = report.rows_replied,
                    "Replies applied"
                );
            }
        }
    });

    (handle, shutdown_flag)
}
