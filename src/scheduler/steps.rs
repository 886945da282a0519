//! Step state machine helpers: scheduling the next step and evaluating
//! step conditions against the event log.

use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::outreach::model::{
    CampaignLeadStatus, EventType, LeadStatus, SequenceStep, StepCondition,
};
use crate::store::{Candidate, Database, StepAdvance};

/// When step `index` becomes due if the previous step completed at `from`.
///
/// `None` once the sequence is exhausted.
pub fn next_action_for(
    steps: &[SequenceStep],
    index: u32,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    steps.get(index as usize).map(|step| from + step.delay())
}

/// Advance from `current` to the following step.
pub fn advance_from(
    steps: &[SequenceStep],
    current: u32,
    now: DateTime<Utc>,
    status: Option<CampaignLeadStatus>,
) -> StepAdvance {
    let to_step = current.saturating_add(1);
    StepAdvance {
        to_step,
        status,
        next_action_at: next_action_for(steps, to_step, now),
    }
}

/// Whether `step` may run for this candidate.
pub async fn condition_holds(
    db: &dyn Database,
    candidate: &Candidate,
    step: &SequenceStep,
) -> Result<bool, DatabaseError> {
    let campaign_id = candidate.row.campaign_id;
    let lead_id = candidate.row.lead_id;

    match step.condition {
        StepCondition::Always => Ok(true),
        StepCondition::IfNoOpen => Ok(!db
            .has_event(campaign_id, lead_id, EventType::EmailOpened)
            .await?),
        StepCondition::IfNoReply => Ok(candidate.lead.status != LeadStatus::Replied
            && candidate.row.status != CampaignLeadStatus::Replied),
        StepCondition::IfClicked => {
            db.has_event(campaign_id, lead_id, EventType::LinkClicked)
                .await
        }
    }
}
