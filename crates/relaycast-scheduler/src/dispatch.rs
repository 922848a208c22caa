//! Dispatch executor: sends a campaign's template to a batch of recipients.
//!
//! Recipients in one batch go out strictly one after another, spaced by the
//! [`SendPacer`]. A provider error for one recipient is written onto that
//! recipient and the loop moves on; only a missing business account stops a
//! batch before it starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relaycast_core::error::{RelayError, Result};
use relaycast_core::traits::{CampaignStore, MessageTransport};
use relaycast_core::types::{
    BusinessAccount, Campaign, CampaignRecipient, CampaignStatus, RecipientTransition,
    TemplateMessage,
};
use serde::Serialize;

use crate::pacer::SendPacer;
use crate::recipient::{self, InvalidTransition};
use crate::template;

/// Result of an initial dispatch batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub sent: u32,
    pub failed: u32,
}

/// Result of a retry batch. `skipped` counts recipients already at the cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Sends template messages and records the outcome on each recipient.
pub struct DispatchExecutor {
    store: Arc<dyn CampaignStore>,
    transport: Arc<dyn MessageTransport>,
    pacer: Arc<SendPacer>,
    send_timeout: Duration,
}

impl DispatchExecutor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        transport: Arc<dyn MessageTransport>,
        pacer: Arc<SendPacer>,
        send_timeout: Duration,
    ) -> Self {
        Self { store, transport, pacer, send_timeout }
    }

    async fn account_for(&self, campaign: &Campaign) -> Result<BusinessAccount> {
        self.store
            .get_business_account(&campaign.account_id)
            .await?
            .ok_or_else(|| RelayError::AccountNotFound(campaign.account_id.clone()))
    }

    /// One paced, time-limited provider call.
    async fn send(&self, account: &BusinessAccount, message: &TemplateMessage) -> Result<String> {
        self.pacer.acquire(&account.id).await;
        match tokio::time::timeout(
            self.send_timeout,
            self.transport.send_template_message(account, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(self.send_timeout.as_secs())),
        }
    }

    fn build_message(campaign: &Campaign, body: Option<&str>, r: &CampaignRecipient) -> TemplateMessage {
        TemplateMessage {
            to: r.phone_number.clone(),
            template_name: campaign.template_name.clone(),
            language: campaign.template_language.clone(),
            header_media: campaign.header_media.clone(),
            params: body.and_then(|b| template::resolve_for_recipient(b, &campaign.template_variables, r)),
        }
    }

    async fn lookup_body(&self, account: &BusinessAccount, campaign: &Campaign) -> Option<String> {
        match self
            .transport
            .fetch_template_body(account, &campaign.template_name, &campaign.template_language)
            .await
        {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(
                    "⚠️ Template body lookup failed for '{}' ({}): {e}",
                    campaign.template_name,
                    campaign.id
                );
                None
            }
        }
    }

    /// Persist a transition. A lost compare-and-set means another writer got
    /// there first; a store error is logged and the recipient keeps its old
    /// row, to be picked up again when the campaign is resumed or retried.
    async fn persist(
        &self,
        before: &CampaignRecipient,
        next: std::result::Result<CampaignRecipient, InvalidTransition>,
    ) -> bool {
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!("Skipping recipient {}: {e}", before.id);
                return false;
            }
        };
        match self.store.apply_transition(&RecipientTransition::between(before, next)).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::debug!("Recipient {} changed concurrently; write dropped", before.id);
                false
            }
            Err(e) => {
                tracing::error!("❌ Could not record outcome for recipient {}: {e}", before.id);
                false
            }
        }
    }

    /// Initial send to `recipients` (expected `pending`).
    ///
    /// A missing business account marks the campaign `failed` and returns
    /// [`RelayError::AccountNotFound`] without contacting the provider.
    pub async fn dispatch(
        &self,
        campaign: &Campaign,
        recipients: &[CampaignRecipient],
    ) -> Result<DispatchOutcome> {
        let account = match self.account_for(campaign).await {
            Ok(account) => account,
            Err(e @ RelayError::AccountNotFound(_)) => {
                self.store
                    .transition_campaign(
                        &campaign.id,
                        &[CampaignStatus::Draft, CampaignStatus::Scheduled, CampaignStatus::Running],
                        CampaignStatus::Failed,
                        Utc::now(),
                    )
                    .await?;
                tracing::error!("❌ Campaign {} failed: {e}", campaign.id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let body = match &campaign.template_body {
            Some(body) => Some(body.clone()),
            None => self.lookup_body(&account, campaign).await,
        };

        tracing::info!(
            "📤 Dispatching campaign {} ('{}') to {} recipients via {}",
            campaign.id,
            campaign.template_name,
            recipients.len(),
            self.transport.name()
        );

        let mut outcome = DispatchOutcome::default();
        for r in recipients {
            let message = Self::build_message(campaign, body.as_deref(), r);
            match self.send(&account, &message).await {
                Ok(message_id) => {
                    if self.persist(r, recipient::mark_sent(r, &message_id, Utc::now())).await {
                        outcome.sent += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Send to {} failed: {e}", r.phone_number);
                    if self.persist(r, recipient::mark_send_failed(r, &e.to_string())).await {
                        outcome.failed += 1;
                    }
                }
            }
        }

        let counters = self.store.refresh_campaign_counters(&campaign.id, Utc::now()).await?;
        tracing::info!(
            "✅ Campaign {} batch done: {} sent, {} failed ({} still pending)",
            campaign.id,
            outcome.sent,
            outcome.failed,
            counters.pending_count
        );
        Ok(outcome)
    }

    /// Retry previously failed `recipients`. The body is looked up fresh so
    /// variable order follows the currently approved template, falling back
    /// to the cached copy.
    pub async fn retry(
        &self,
        campaign: &Campaign,
        recipients: &[CampaignRecipient],
        skipped: u32,
    ) -> Result<RetryOutcome> {
        let mut outcome = RetryOutcome { skipped, ..RetryOutcome::default() };
        if recipients.is_empty() {
            return Ok(outcome);
        }

        let account = self.account_for(campaign).await?;
        let body = match self.lookup_body(&account, campaign).await {
            Some(body) => Some(body),
            None => campaign.template_body.clone(),
        };

        tracing::info!("🔁 Retrying {} recipients of campaign {}", recipients.len(), campaign.id);

        for r in recipients {
            let message = Self::build_message(campaign, body.as_deref(), r);
            let now = Utc::now();
            match self.send(&account, &message).await {
                Ok(message_id) => {
                    if self.persist(r, recipient::retry_succeeded(r, &message_id, now)).await {
                        outcome.success += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Retry to {} failed: {e}", r.phone_number);
                    if self.persist(r, recipient::retry_failed(r, &e.to_string(), now)).await {
                        outcome.failed += 1;
                    }
                }
            }
        }

        self.store.refresh_campaign_counters(&campaign.id, Utc::now()).await?;
        tracing::info!(
            "🔁 Campaign {} retry done: {} succeeded, {} failed, {} at cap",
            campaign.id,
            outcome.success,
            outcome.failed,
            outcome.skipped
        );
        Ok(outcome)
    }
}
