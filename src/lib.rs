//! Outreach engine: scheduled, paced multi-step email campaigns.

pub mod config;
pub mod error;
pub mod mailer;
pub mod outreach;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod worker;
