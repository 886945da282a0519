//! Backend-agnostic `Database` trait over the outreach tables.
//!
//! Every mutation the scheduler and worker rely on for correctness is a
//! single conditional statement, so concurrent callers never need a lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::outreach::model::{
    Campaign, CampaignLead, CampaignLeadStatus, CampaignPlan, CampaignStatus, Event, EventType,
    Lead, Mailbox, MailboxStatus, ReplyClassification, SequenceStep,
};

/// A due campaign-lead row with everything needed to process it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub row: CampaignLead,
    pub plan: Arc<CampaignPlan>,
    pub lead: Lead,
}

impl Candidate {
    pub fn mailbox_id(&self) -> Option<Uuid> {
        self.plan.campaign.mailbox_id
    }
}

/// Move a campaign-lead forward to `to_step`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepAdvance {
    pub to_step: u32,
    /// New status; `None` keeps the current one.
    pub status: Option<CampaignLeadStatus>,
    pub next_action_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError>;

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError>;

    /// Case-insensitive lookup by sender address.
    async fn get_mailbox_by_email(&self, email: &str) -> Result<Option<Mailbox>, DatabaseError>;

    async fn list_mailboxes(
        &self,
        status: Option<MailboxStatus>,
    ) -> Result<Vec<Mailbox>, DatabaseError>;

    /// Mailboxes with warmup enabled.
    async fn list_warmup_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError>;

    /// Raise `daily_limit` to `target` if it is currently lower.
    async fn raise_daily_limit(&self, id: Uuid, target: i64) -> Result<bool, DatabaseError>;

    /// Take one unit of today's send budget. `false` when the cap is reached.
    async fn reserve_send(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Give back a unit taken by `reserve_send`.
    async fn release_send(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Daily counter reset, normally driven from outside the engine.
    async fn reset_sent_count(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead. Fails with `Constraint` if the email already exists
    /// in the workspace.
    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Case-insensitive lookup across workspaces.
    async fn find_leads_by_email(&self, email: &str) -> Result<Vec<Lead>, DatabaseError>;

    async fn mark_lead_replied(
        &self,
        id: Uuid,
        classification: ReplyClassification,
    ) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    async fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>, DatabaseError>;

    async fn set_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    /// Conditional status change. Returns whether it happened.
    async fn transition_campaign_status(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> Result<bool, DatabaseError>;

    /// Delete a campaign with its steps, rows and events.
    async fn delete_campaign(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Insert a step. Fails with `Constraint` on a duplicate order.
    async fn insert_step(&self, step: &SequenceStep) -> Result<(), DatabaseError>;

    /// Steps sorted ascending by order.
    async fn list_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError>;

    /// Campaign with ordered steps and its mailbox.
    async fn load_plan(&self, campaign_id: Uuid) -> Result<Option<CampaignPlan>, DatabaseError>;

    // ── Campaign leads ──────────────────────────────────────────────

    /// Insert unless the (campaign, lead) pair exists. Returns whether a row was added.
    async fn insert_campaign_lead(&self, row: &CampaignLead) -> Result<bool, DatabaseError>;

    async fn get_campaign_lead(&self, id: Uuid) -> Result<Option<CampaignLead>, DatabaseError>;

    async fn find_campaign_lead(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<CampaignLead>, DatabaseError>;

    async fn list_campaign_leads(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CampaignLead>, DatabaseError>;

    /// Active rows of active, started campaigns that are due at `now`,
    /// plus exhausted rows with nothing scheduled. Ordered by
    /// `next_action_at` ascending (unscheduled first), then id.
    async fn due_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candidate>, DatabaseError>;

    /// Push `next_action_at` out without touching the step.
    async fn reschedule_campaign_lead(
        &self,
        id: Uuid,
        expected_step: u32,
        next_action_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Compare-and-set on `current_step`. Only active rows move, and only forward.
    async fn advance_campaign_lead(
        &self,
        id: Uuid,
        from_step: u32,
        advance: &StepAdvance,
    ) -> Result<bool, DatabaseError>;

    /// Move an active row to a terminal status and clear its schedule.
    /// A send failure may also overwrite IGNORED.
    async fn finish_campaign_lead(
        &self,
        id: Uuid,
        status: CampaignLeadStatus,
        failure_reason: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// `new`/`contacted` to `sent` after a successful send.
    async fn mark_campaign_lead_sent(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Move every active row of a lead to `replied`. Returns the rows moved.
    async fn mark_lead_rows_replied(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<CampaignLead>, DatabaseError>;

    /// Active rows that still have a scheduled action or an exhausted
    /// sequence the poller has yet to finish.
    async fn count_pending_campaign_leads(&self, campaign_id: Uuid) -> Result<u64, DatabaseError>;

    async fn campaign_lead_tally(
        &self,
        campaign_id: Uuid,
    ) -> Result<HashMap<CampaignLeadStatus, u64>, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError>;

    async fn has_event(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
        event_type: EventType,
    ) -> Result<bool, DatabaseError>;

    /// Events for a lead, oldest first.
    async fn list_events(&self, lead_id: Uuid) -> Result<Vec<Event>, DatabaseError>;

    /// Leads in the campaign without an event of `event_type` in it.
    async fn leads_without_event(
        &self,
        campaign_id: Uuid,
        event_type: EventType,
    ) -> Result<Vec<Uuid>, DatabaseError>;
}
