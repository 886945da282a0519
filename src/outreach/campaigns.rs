//! Campaign lifecycle: creating campaigns, attaching steps and leads,
//! status changes, resend-to-non-openers and engagement tracking.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{CampaignError, DatabaseError};
use crate::outreach::model::{
    Campaign, CampaignLead, CampaignStatus, Event, EventType, Lead, Mailbox, SequenceStep,
    StepType,
};
use crate::store::Database;

/// Upstream-facing operations that create and mutate campaign rows.
///
/// The scheduler and worker own every transition after a lead is attached.
pub struct CampaignService {
    db: Arc<dyn Database>,
}

impl CampaignService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn create_mailbox(&self, mailbox: Mailbox) -> Result<Mailbox, CampaignError> {
        if !mailbox.email.contains('@') {
            return Err(CampaignError::InvalidCampaign(format!(
                "mailbox address {:?} is not an email",
                mailbox.email
            )));
        }
        self.db.insert_mailbox(&mailbox).await?;
        info!(mailbox_id = %mailbox.id, email = %mailbox.email, "Mailbox created");
        Ok(mailbox)
    }

    /// Fails with a constraint error if the email already exists in the workspace.
    pub async fn create_lead(&self, lead: Lead) -> Result<Lead, CampaignError> {
        if !lead.email.contains('@') {
            return Err(CampaignError::InvalidCampaign(format!(
                "lead address {:?} is not an email",
                lead.email
            )));
        }
        self.db.insert_lead(&lead).await?;
        Ok(lead)
    }

    /// Store a new campaign in DRAFT.
    pub async fn create_campaign(&self, mut campaign: Campaign) -> Result<Campaign, CampaignError> {
        if campaign.name.trim().is_empty() {
            return Err(CampaignError::InvalidCampaign("name is empty".into()));
        }
        if campaign.pacing_interval_minutes == 0 {
            return Err(CampaignError::InvalidCampaign(
                "pacing interval must be at least one minute".into(),
            ));
        }
        if let Some(mailbox_id) = campaign.mailbox_id {
            if self.db.get_mailbox(mailbox_id).await?.is_none() {
                return Err(DatabaseError::not_found("mailbox", mailbox_id).into());
            }
        }

        campaign.status = CampaignStatus::Draft;
        self.db.insert_campaign(&campaign).await?;
        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    pub async fn add_step(&self, step: SequenceStep) -> Result<SequenceStep, CampaignError> {
        if step.step_type == StepType::Email && step.subject.trim().is_empty() {
            return Err(CampaignError::InvalidStep(format!(
                "email step {} has no subject",
                step.order
            )));
        }
        if self.db.get_campaign(step.campaign_id).await?.is_none() {
            return Err(DatabaseError::not_found("campaign", step.campaign_id).into());
        }

        match self.db.insert_step(&step).await {
            Ok(()) => Ok(step),
            Err(DatabaseError::Constraint(_)) => Err(CampaignError::InvalidStep(format!(
                "order {} is already used in campaign {}",
                step.order, step.campaign_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Attach a lead. Adding the same lead twice returns the existing row.
    pub async fn add_lead_to_campaign(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<CampaignLead, CampaignError> {
        if self.db.get_campaign(campaign_id).await?.is_none() {
            return Err(DatabaseError::not_found("campaign", campaign_id).into());
        }
        if self.db.get_lead(lead_id).await?.is_none() {
            return Err(DatabaseError::not_found("lead", lead_id).into());
        }

        let row = CampaignLead::new(campaign_id, lead_id, Utc::now());
        if self.db.insert_campaign_lead(&row).await? {
            return Ok(row);
        }
        self.db
            .find_campaign_lead(campaign_id, lead_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("campaign_lead", row.id).into())
    }

    pub async fn set_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), CampaignError> {
        self.db.set_campaign_status(campaign_id, status).await?;
        info!(campaign_id = %campaign_id, status = status.as_str(), "Campaign status changed");
        Ok(())
    }

    pub async fn activate(&self, campaign_id: Uuid) -> Result<(), CampaignError> {
        self.set_status(campaign_id, CampaignStatus::Active).await
    }

    pub async fn pause(&self, campaign_id: Uuid) -> Result<(), CampaignError> {
        self.set_status(campaign_id, CampaignStatus::Paused).await
    }

    /// Copy a campaign into a fresh DRAFT aimed at the leads that never
    /// opened anything in it.
    pub async fn clone_for_non_openers(&self, campaign_id: Uuid) -> Result<Campaign, CampaignError> {
        let source = self
            .db
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("campaign", campaign_id))?;

        let lead_ids = self
            .db
            .leads_without_event(campaign_id, EventType::EmailOpened)
            .await?;
        if lead_ids.is_empty() {
            return Err(CampaignError::NoNonOpeners(campaign_id));
        }

        let now = Utc::now();
        let resend = Campaign {
            id: Uuid::new_v4(),
            name: format!("Resend: {}", source.name),
            status: CampaignStatus::Draft,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            ..source.clone()
        };
        self.db.insert_campaign(&resend).await?;

        for step in self.db.list_steps(campaign_id).await? {
            let copy = SequenceStep {
                id: Uuid::new_v4(),
                campaign_id: resend.id,
                ..step
            };
            self.db.insert_step(&copy).await?;
        }

        for lead_id in &lead_ids {
            self.db
                .insert_campaign_lead(&CampaignLead::new(resend.id, *lead_id, now))
                .await?;
        }

        info!(
            source_id = %campaign_id,
            campaign_id = %resend.id,
            leads = lead_ids.len(),
            "Cloned campaign for non-openers"
        );
        Ok(resend)
    }

    /// Delete a campaign together with its steps, rows and events.
    pub async fn delete_campaign(&self, campaign_id: Uuid) -> Result<bool, CampaignError> {
        let deleted = self.db.delete_campaign(campaign_id).await?;
        if deleted {
            info!(campaign_id = %campaign_id, "Campaign deleted");
        }
        Ok(deleted)
    }

    /// Append an open or click for a campaign-lead, as reported by the
    /// tracking endpoints.
    pub async fn record_engagement(
        &self,
        campaign_lead_id: Uuid,
        sequence_id: Option<Uuid>,
        event_type: EventType,
        metadata: serde_json::Value,
    ) -> Result<Event, CampaignError> {
        if !matches!(event_type, EventType::EmailOpened | EventType::LinkClicked) {
            return Err(CampaignError::NotEngagement(event_type.as_str().to_string()));
        }
        let row = self
            .db
            .get_campaign_lead(campaign_lead_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("campaign_lead", campaign_lead_id))?;

        let mut event = Event::new(event_type, row.lead_id)
            .campaign(row.campaign_id)
            .metadata(metadata);
        if let Some(sequence_id) = sequence_id {
            event = event.step(sequence_id);
        }
        self.db.insert_event(&event).await?;
        Ok(event)
    }
}
