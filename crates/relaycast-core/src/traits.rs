//! Capability traits the engine is written against.
//!
//! The engine never touches SQL or HTTP directly; it only sees these.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    BusinessAccount, Campaign, CampaignCounters, CampaignRecipient, CampaignStatus,
    RecipientStatus, RecipientTransition, TemplateMessage,
};

/// Persistent campaign storage.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>>;

    /// Move a campaign to `to` only if its current status is one of `from`.
    /// Stamps `started_at` on `running` and `completed_at` on
    /// `completed`/`failed`. Returns false when the guard did not match.
    async fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `scheduled` campaigns whose `scheduled_at <= now`.
    async fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    /// `running` campaigns, for resuming batches interrupted by a crash or a
    /// failed write.
    async fn list_running_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Auto-retry campaigns in a status that accepts retry sweeps.
    async fn list_auto_retry_campaigns(&self) -> Result<Vec<Campaign>>;

    async fn insert_recipients(&self, recipients: &[CampaignRecipient]) -> Result<()>;

    async fn get_recipient(&self, id: &str) -> Result<Option<CampaignRecipient>>;

    async fn recipients_by_status(
        &self,
        campaign_id: &str,
        status: RecipientStatus,
    ) -> Result<Vec<CampaignRecipient>>;

    /// Failed recipients below `max_retries`; when `cooldown_minutes` is set,
    /// only those never retried or last retried at least that long ago.
    async fn retry_eligible_recipients(
        &self,
        campaign_id: &str,
        max_retries: u32,
        cooldown_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignRecipient>>;

    async fn recipient_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignRecipient>>;

    /// Compare-and-set write. Returns false on conflict.
    async fn apply_transition(&self, transition: &RecipientTransition) -> Result<bool>;

    /// Recount all recipients and persist the counters in one transaction.
    /// A `running` campaign with no pending recipients becomes `completed`.
    async fn refresh_campaign_counters(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CampaignCounters>;

    async fn get_business_account(&self, id: &str) -> Result<Option<BusinessAccount>>;

    async fn upsert_business_account(&self, account: &BusinessAccount) -> Result<()>;
}

/// Outbound message transport (e.g. WhatsApp Cloud API).
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Send one template message; returns the provider message id.
    async fn send_template_message(
        &self,
        account: &BusinessAccount,
        message: &TemplateMessage,
    ) -> Result<String>;

    /// Body text of an approved template, used to re-derive variable order.
    async fn fetch_template_body(
        &self,
        account: &BusinessAccount,
        template_name: &str,
        language: &str,
    ) -> Result<String>;
}
