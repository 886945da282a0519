//! Outreach domain: campaigns, sequences, leads, mailboxes and their lifecycle.

pub mod campaigns;
pub mod classifier;
pub mod model;
pub mod window;

pub use campaigns::CampaignService;
pub use classifier::classify_reply;
pub use model::{
    Campaign, CampaignLead, CampaignLeadStatus, CampaignPlan, CampaignStatus, Event, EventType,
    Lead, LeadStatus, Mailbox, MailboxStatus, ReplyClassification, SequenceStep, SmtpSettings,
    StepCondition, StepType,
};
pub use window::SendWindow;
