//! Outreach domain types: campaigns, steps, leads, mailboxes, events.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::window::SendWindow;

// ── Status enums ────────────────────────────────────────────────────

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// State of one (campaign, lead) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignLeadStatus {
    New,
    Contacted,
    Sent,
    Replied,
    Ignored,
    Failed,
}

impl CampaignLeadStatus {
    /// Statuses the scheduler still works on.
    pub const ACTIVE: [CampaignLeadStatus; 3] = [Self::New, Self::Contacted, Self::Sent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Sent => "sent",
            Self::Replied => "replied",
            Self::Ignored => "ignored",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for CampaignLeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignLeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "sent" => Ok(Self::Sent),
            "replied" => Ok(Self::Replied),
            "ignored" => Ok(Self::Ignored),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown campaign lead status: {other}")),
        }
    }
}

/// Global status of a lead across campaigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Replied,
    Bounced,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Replied => "replied",
            Self::Bounced => "bounced",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "replied" => Ok(Self::Replied),
            "bounced" => Ok(Self::Bounced),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Active,
    Paused,
    Error,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl FromStr for MailboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown mailbox status: {other}")),
        }
    }
}

/// Sentiment tag attached to a lead after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyClassification {
    #[serde(rename = "OOO")]
    OutOfOffice,
    Negative,
    Positive,
    Info,
}

impl ReplyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfOffice => "OOO",
            Self::Negative => "NEGATIVE",
            Self::Positive => "POSITIVE",
            Self::Info => "INFO",
        }
    }
}

impl FromStr for ReplyClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OOO" => Ok(Self::OutOfOffice),
            "NEGATIVE" => Ok(Self::Negative),
            "POSITIVE" => Ok(Self::Positive),
            "INFO" => Ok(Self::Info),
            other => Err(format!("unknown classification: {other}")),
        }
    }
}

// ── Sequence steps ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Email,
    Delay,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Delay => "delay",
        }
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "delay" => Ok(Self::Delay),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// Gate evaluated when a step becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    #[default]
    Always,
    IfNoOpen,
    IfNoReply,
    IfClicked,
}

impl StepCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::IfNoOpen => "if_no_open",
            Self::IfNoReply => "if_no_reply",
            Self::IfClicked => "if_clicked",
        }
    }
}

impl fmt::Display for StepCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "if_no_open" => Ok(Self::IfNoOpen),
            "if_no_reply" => Ok(Self::IfNoReply),
            "if_clicked" => Ok(Self::IfClicked),
            other => Err(format!("unknown step condition: {other}")),
        }
    }
}

/// One step of a campaign sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 0-based position; unique within the campaign.
    pub order: u32,
    pub step_type: StepType,
    pub subject: String,
    pub body: String,
    pub delay_days: u32,
    pub delay_hours: u32,
    pub condition: StepCondition,
}

impl SequenceStep {
    pub fn email(campaign_id: Uuid, order: u32, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            order,
            step_type: StepType::Email,
            subject: subject.to_string(),
            body: body.to_string(),
            delay_days: 0,
            delay_hours: 0,
            condition: StepCondition::Always,
        }
    }

    pub fn with_delay(mut self, days: u32, hours: u32) -> Self {
        self.delay_days = days;
        self.delay_hours = hours;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Wait before this step fires after the previous one.
    pub fn delay(&self) -> Duration {
        Duration::days(i64::from(self.delay_days)) + Duration::hours(i64::from(self.delay_hours))
    }
}

// ── Campaigns ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: Uuid,
    pub workspace_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub mailbox_id: Option<Uuid>,
    /// Display only; the enforced limit lives on the mailbox.
    pub daily_limit: i64,
    pub window: SendWindow,
    pub pacing_interval_minutes: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub const DEFAULT_PACING_MINUTES: u32 = 5;

    pub fn new(workspace_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            status: CampaignStatus::Draft,
            mailbox_id: None,
            daily_limit: 50,
            window: SendWindow::Unbounded,
            pacing_interval_minutes: Self::DEFAULT_PACING_MINUTES,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_mailbox(mut self, mailbox_id: Uuid) -> Self {
        self.mailbox_id = Some(mailbox_id);
        self
    }

    pub fn with_window(mut self, window: SendWindow) -> Self {
        self.window = window;
        self
    }
}

/// A campaign with everything the scheduler needs to act on it.
#[derive(Debug, Clone)]
pub struct CampaignPlan {
    pub campaign: Campaign,
    /// Sorted ascending by `order`.
    pub steps: Vec<SequenceStep>,
    pub mailbox: Option<Mailbox>,
}

// ── Leads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Lead {
    pub id: Uuid,
    pub workspace_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: LeadStatus,
    pub classification: Option<ReplyClassification>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(workspace_id: &str, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.to_string(),
            email: email.to_string(),
            first_name: None,
            last_name: None,
            company: None,
            metadata: serde_json::Map::new(),
            status: LeadStatus::New,
            classification: None,
            created_at: Utc::now(),
        }
    }

    /// Personalization variables: metadata first, lead fields win on collision.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self
            .metadata
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();

        let fields = [
            ("firstName", &self.first_name),
            ("lastName", &self.last_name),
            ("company", &self.company),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                vars.insert(key.to_string(), v.clone());
            }
        }
        vars.insert("email".to_string(), self.email.clone());
        vars
    }
}

/// Progress row for one lead inside one campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignLead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub status: CampaignLeadStatus,
    /// Index of the next step to attempt.
    pub current_step: u32,
    /// `None` means nothing is scheduled.
    pub next_action_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignLead {
    pub fn new(campaign_id: Uuid, lead_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            lead_id,
            status: CampaignLeadStatus::New,
            current_step: 0,
            next_action_at: Some(now),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Mailboxes ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub from_name: Option<String>,
    pub smtp: SmtpSettings,
    pub status: MailboxStatus,
    /// Sends reserved today. Reset externally.
    pub sent_count: i64,
    pub daily_limit: i64,
    pub warmup_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    pub fn new(email: &str, smtp: SmtpSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: None,
            from_name: None,
            smtp,
            status: MailboxStatus::Active,
            sent_count: 0,
            daily_limit: 50,
            warmup_enabled: false,
            created_at: Utc::now(),
        }
    }

    /// Display name used in the From header.
    pub fn display_name(&self) -> &str {
        self.from_name
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.email)
    }

    pub fn has_capacity(&self) -> bool {
        self.sent_count < self.daily_limit
    }
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EmailQueued,
    EmailSent,
    EmailFailed,
    ReplyReceived,
    StepSkipped,
    EmailOpened,
    LinkClicked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailQueued => "EMAIL_QUEUED",
            Self::EmailSent => "EMAIL_SENT",
            Self::EmailFailed => "EMAIL_FAILED",
            Self::ReplyReceived => "REPLY_RECEIVED",
            Self::StepSkipped => "STEP_SKIPPED",
            Self::EmailOpened => "EMAIL_OPENED",
            Self::LinkClicked => "LINK_CLICKED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL_QUEUED" => Ok(Self::EmailQueued),
            "EMAIL_SENT" => Ok(Self::EmailSent),
            "EMAIL_FAILED" => Ok(Self::EmailFailed),
            "REPLY_RECEIVED" => Ok(Self::ReplyReceived),
            "STEP_SKIPPED" => Ok(Self::StepSkipped),
            "EMAIL_OPENED" => Ok(Self::EmailOpened),
            "LINK_CLICKED" => Ok(Self::LinkClicked),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Append-only activity record.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Option<Uuid>,
    pub lead_id: Uuid,
    pub sequence_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, lead_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            campaign_id: None,
            lead_id,
            sequence_id: None,
            created_at: Utc::now(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn campaign(mut self, campaign_id: Uuid) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    pub fn step(mut self, sequence_id: Uuid) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_through_strings() {
        for status in [
            CampaignLeadStatus::New,
            CampaignLeadStatus::Contacted,
            CampaignLeadStatus::Sent,
            CampaignLeadStatus::Replied,
            CampaignLeadStatus::Ignored,
            CampaignLeadStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CampaignLeadStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn active_statuses() {
        assert!(CampaignLeadStatus::New.is_active());
        assert!(CampaignLeadStatus::Sent.is_active());
        assert!(CampaignLeadStatus::Replied.is_terminal());
        assert!(CampaignLeadStatus::Ignored.is_terminal());
    }

    #[test]
    fn lead_fields_override_metadata() {
        let mut lead = Lead::new("ws", "alice@example.com");
        lead.first_name = Some("Alice".into());
        lead.metadata
            .insert("firstName".into(), serde_json::json!("Ally"));
        lead.metadata
            .insert("customMessage".into(), serde_json::json!("Loved the talk"));
        lead.metadata.insert("seats".into(), serde_json::json!(12));

        let vars = lead.template_vars();
        assert_eq!(vars["firstName"], "Alice");
        assert_eq!(vars["customMessage"], "Loved the talk");
        assert_eq!(vars["seats"], "12");
        assert_eq!(vars["email"], "alice@example.com");
        assert!(!vars.contains_key("company"));
    }

    #[test]
    fn step_delay_combines_days_and_hours() {
        let step = SequenceStep::email(Uuid::new_v4(), 1, "s", "b").with_delay(2, 5);
        assert_eq!(step.delay(), Duration::hours(53));
    }

    #[test]
    fn mailbox_display_name_fallbacks() {
        let smtp = SmtpSettings {
            host: "smtp.example.com".into(),
            port: 587,
            username: "u".into(),
            password: SecretString::from("p".to_string()),
        };
        let mut mb = Mailbox::new("sales@example.com", smtp);
        assert_eq!(mb.display_name(), "sales@example.com");
        mb.name = Some("Sales".into());
        assert_eq!(mb.display_name(), "Sales");
        mb.from_name = Some("Dana from Acme".into());
        assert_eq!(mb.display_name(), "Dana from Acme");
    }
}
