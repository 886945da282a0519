//! Completion sweep: ACTIVE campaigns with no pending rows become COMPLETED.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::outreach::model::{CampaignLeadStatus, CampaignStatus};
use crate::store::Database;

/// Complete every active campaign whose rows have nothing left scheduled.
///
/// A row counts as pending while it is active and either has a
/// `next_action_at` or has run past its last step. Exhausted rows are
/// finished as IGNORED by the poller, so the campaign completes on the
/// tick after.
/// Returns the ids of campaigns transitioned by this call.
pub async fn sweep_completions(db: &dyn Database) -> Result<Vec<Uuid>, DatabaseError> {
    let mut completed = Vec::new();
    for campaign in db.list_campaigns(CampaignStatus::Active).await? {
        let pending = match db.count_pending_campaign_leads(campaign.id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(campaign_id = %campaign.id, "Completion check failed: {}", e);
                continue;
            }
        };
        if pending > 0 {
            continue;
        }

        if !db
            .transition_campaign_status(campaign.id, CampaignStatus::Active, CampaignStatus::Completed)
            .await?
        {
            continue;
        }

        let tally = db.campaign_lead_tally(campaign.id).await.unwrap_or_default();
        let count = |status: CampaignLeadStatus| tally.get(&status).copied().unwrap_or(0);
        info!(
            campaign_id = %campaign.id,
            replied = count(CampaignLeadStatus::Replied),
            ignored = count(CampaignLeadStatus::Ignored),
            failed = count(CampaignLeadStatus::Failed),
            awaiting = count(CampaignLeadStatus::Contacted) + count(CampaignLeadStatus::Sent),
            "Campaign completed"
        );
        completed.push(campaign.id);
    }
    Ok(completed)
}
