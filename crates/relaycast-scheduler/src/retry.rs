//! Retry selection: which failed recipients get another attempt.
//!
//! Read-only: nothing here mutates a recipient. Whether a campaign takes part
//! in automatic sweeps at all (`auto_retry_enabled`) is the scheduler's call.

use chrono::{DateTime, Duration, Utc};
use relaycast_core::error::Result;
use relaycast_core::traits::CampaignStore;
use relaycast_core::types::{Campaign, CampaignRecipient, RecipientStatus};

/// Who asked for the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Scheduler sweep; honours the cooldown.
    Auto,
    /// Operator-triggered; skips the cooldown but not the cap.
    Manual,
}

/// Bounded-retry policy derived from a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn from_campaign(campaign: &Campaign) -> Self {
        Self {
            max_retries: campaign.retry.max_retries,
            cooldown: Duration::minutes(i64::from(campaign.retry.retry_delay_minutes)),
        }
    }

    /// At the cap: permanently out of automatic and manual retries.
    pub fn is_exhausted(&self, recipient: &CampaignRecipient) -> bool {
        recipient.retry_count >= self.max_retries
    }

    /// Never-retried recipients are eligible straight away.
    pub fn cooldown_elapsed(&self, recipient: &CampaignRecipient, now: DateTime<Utc>) -> bool {
        match recipient.last_retry_at {
            None => true,
            Some(last) => now - last >= self.cooldown,
        }
    }

    pub fn is_eligible(&self, recipient: &CampaignRecipient, now: DateTime<Utc>, mode: RetryMode) -> bool {
        recipient.status == RecipientStatus::Failed
            && !self.is_exhausted(recipient)
            && (mode == RetryMode::Manual || self.cooldown_elapsed(recipient, now))
    }
}

/// Result of a selection pass.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub eligible: Vec<CampaignRecipient>,
    /// Failed recipients excluded because they hit `max_retries`.
    pub exhausted: u32,
}

/// Select retryable recipients for `campaign`.
pub async fn select_retryable(
    store: &dyn CampaignStore,
    campaign: &Campaign,
    mode: RetryMode,
    now: DateTime<Utc>,
) -> Result<Selection> {
    let policy = RetryPolicy::from_campaign(campaign);
    let cooldown = match mode {
        RetryMode::Auto => Some(campaign.retry.retry_delay_minutes),
        RetryMode::Manual => None,
    };

    let candidates = store
        .retry_eligible_recipients(&campaign.id, policy.max_retries, cooldown, now)
        .await?;
    // The store query is a prefilter; the policy has the final say.
    let eligible: Vec<CampaignRecipient> = candidates
        .into_iter()
        .filter(|r| policy.is_eligible(r, now, mode))
        .collect();

    let exhausted = store
        .recipients_by_status(&campaign.id, RecipientStatus::Failed)
        .await?
        .iter()
        .filter(|r| policy.is_exhausted(r))
        .count() as u32;

    Ok(Selection { eligible, exhausted })
}
