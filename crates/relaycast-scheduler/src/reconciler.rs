//! Webhook status reconciliation.
//!
//! Events arrive at least once and in any order. Each one is applied to the
//! recipient's current row through the delivery lattice and written with a
//! compare-and-set; on conflict the row is re-read and the event re-applied.

use std::sync::Arc;

use chrono::Utc;
use relaycast_core::error::Result;
use relaycast_core::traits::CampaignStore;
use relaycast_core::types::{RecipientStatus, RecipientTransition, StatusEvent};

use crate::recipient;

/// What happened to one status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No recipient owns this message id.
    UnknownMessage,
    /// Recipient moved (or had a timestamp filled); new status.
    Applied(RecipientStatus),
    /// Duplicate, stale or regressing event.
    Ignored,
}

pub struct StatusReconciler {
    store: Arc<dyn CampaignStore>,
    conflict_attempts: u32,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn CampaignStore>, conflict_attempts: u32) -> Self {
        Self {
            store,
            conflict_attempts: conflict_attempts.max(1),
        }
    }

    pub async fn apply_status_event(&self, event: &StatusEvent) -> Result<ReconcileOutcome> {
        let at = event.timestamp();
        let detail = event.error_summary();

        for attempt in 1..=self.conflict_attempts {
            let Some(current) = self
                .store
                .recipient_by_provider_message_id(&event.provider_message_id)
                .await?
            else {
                tracing::debug!("Status '{:?}' for unknown message {}", event.status, event.provider_message_id);
                return Ok(ReconcileOutcome::UnknownMessage);
            };

            let Some(next) = recipient::apply_delivery_event(&current, event.status, at, &detail) else {
                return Ok(ReconcileOutcome::Ignored);
            };
            let status = next.status;

            if self
                .store
                .apply_transition(&RecipientTransition::between(&current, next))
                .await?
            {
                self.store
                    .refresh_campaign_counters(&current.campaign_id, Utc::now())
                    .await?;
                tracing::debug!(
                    "📬 {} → {} (campaign {})",
                    event.provider_message_id,
                    status,
                    current.campaign_id
                );
                return Ok(ReconcileOutcome::Applied(status));
            }

            tracing::debug!(
                "Conflict applying status to {} (attempt {attempt}/{})",
                current.id,
                self.conflict_attempts
            );
        }

        tracing::warn!(
            "⚠️ Gave up applying '{:?}' for {} after {} conflicts",
            event.status,
            event.provider_message_id,
            self.conflict_attempts
        );
        Ok(ReconcileOutcome::Ignored)
    }
}
