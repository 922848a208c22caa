//! Recipient state machine.
//!
//! Every transition is a pure function from the current row to the next
//! row. Callers persist the result with a compare-and-set
//! (`RecipientTransition`), so two writers racing on one recipient cannot both
//! win.
//!
//! ```text
//!            dispatch ok             webhook            webhook
//!  pending ──────────────▶ sent ──────────────▶ delivered ──────▶ read
//!     │                     ▲ │                     │
//!     │ dispatch error      │ │ webhook failed      │ webhook failed
//!     ▼        retry ok     │ ▼                     ▼
//!  failed ──────────────────┘ failed ◀──────────────┘
//!     └─▶ failed (retry error, retry_count + 1)
//! ```

use chrono::{DateTime, Utc};
use relaycast_core::types::{CampaignRecipient, DeliveryStatus, RecipientStatus};

/// A transition not allowed from the recipient's current status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("recipient cannot move from {from} via {action}")]
pub struct InvalidTransition {
    pub from: RecipientStatus,
    pub action: &'static str,
}

fn require(
    recipient: &CampaignRecipient,
    status: RecipientStatus,
    action: &'static str,
) -> Result<(), InvalidTransition> {
    if recipient.status == status {
        Ok(())
    } else {
        Err(InvalidTransition { from: recipient.status, action })
    }
}

/// `pending → sent` after a successful initial send.
pub fn mark_sent(
    recipient: &CampaignRecipient,
    provider_message_id: &str,
    at: DateTime<Utc>,
) -> Result<CampaignRecipient, InvalidTransition> {
    require(recipient, RecipientStatus::Pending, "dispatch success")?;
    let mut next = recipient.clone();
    next.status = RecipientStatus::Sent;
    next.provider_message_id = Some(provider_message_id.to_string());
    next.sent_at = Some(at);
    next.error_message = None;
    Ok(next)
}

/// `pending → failed` after an initial send error. The message is kept verbatim.
pub fn mark_send_failed(
    recipient: &CampaignRecipient,
    error: &str,
) -> Result<CampaignRecipient, InvalidTransition> {
    require(recipient, RecipientStatus::Pending, "dispatch error")?;
    let mut next = recipient.clone();
    next.status = RecipientStatus::Failed;
    next.error_message = Some(error.to_string());
    Ok(next)
}

/// `failed → sent` on a successful retry. The fresh message id replaces the
/// old one, and delivery timestamps from the earlier attempt are cleared.
pub fn retry_succeeded(
    recipient: &CampaignRecipient,
    provider_message_id: &str,
    at: DateTime<Utc>,
) -> Result<CampaignRecipient, InvalidTransition> {
    require(recipient, RecipientStatus::Failed, "retry success")?;
    let mut next = recipient.clone();
    next.status = RecipientStatus::Sent;
    next.retry_count = recipient.retry_count + 1;
    next.last_retry_at = Some(at);
    next.sent_at = Some(at);
    next.delivered_at = None;
    next.read_at = None;
    next.provider_message_id = Some(provider_message_id.to_string());
    next.error_message = None;
    Ok(next)
}

/// `failed → failed` on a retry error; the attempt still counts.
pub fn retry_failed(
    recipient: &CampaignRecipient,
    error: &str,
    at: DateTime<Utc>,
) -> Result<CampaignRecipient, InvalidTransition> {
    require(recipient, RecipientStatus::Failed, "retry error")?;
    let attempt = recipient.retry_count + 1;
    let mut next = recipient.clone();
    next.retry_count = attempt;
    next.last_retry_at = Some(at);
    next.error_message = Some(format!("Retry attempt {attempt}: {error}"));
    Ok(next)
}

fn stamp(next: &mut CampaignRecipient, status: RecipientStatus, at: DateTime<Utc>) {
    let slot = match status {
        RecipientStatus::Sent => &mut next.sent_at,
        RecipientStatus::Delivered => &mut next.delivered_at,
        RecipientStatus::Read => &mut next.read_at,
        RecipientStatus::Pending | RecipientStatus::Failed => return,
    };
    if slot.is_none() {
        *slot = Some(at);
    }
}

/// Apply a webhook status to a recipient.
///
/// Returns `None` when the event changes nothing: a duplicate, an update that
/// would move progress backwards, or a progress event for a failed recipient.
/// A failure is reachable from every state, so the resting status does not
/// depend on the order events arrive in.
pub fn apply_delivery_event(
    recipient: &CampaignRecipient,
    status: DeliveryStatus,
    at: DateTime<Utc>,
    error_detail: &str,
) -> Option<CampaignRecipient> {
    let mut next = recipient.clone();

    match status {
        DeliveryStatus::Failed => match recipient.status {
            RecipientStatus::Pending
            | RecipientStatus::Sent
            | RecipientStatus::Delivered
            | RecipientStatus::Read => {
                let detail = if error_detail.is_empty() { "Delivery failed" } else { error_detail };
                next.status = RecipientStatus::Failed;
                next.error_message = Some(match &recipient.error_message {
                    Some(prev) if !prev.is_empty() => format!("{prev} | {detail}"),
                    _ => detail.to_string(),
                });
            }
            RecipientStatus::Failed => return None,
        },
        progress => {
            if recipient.status == RecipientStatus::Failed {
                return None;
            }
            let target = progress.as_recipient_status();
            if target.progress_rank() > recipient.status.progress_rank() {
                next.status = target;
            }
            // Timestamps are first-write-wins, so a late "delivered" after
            // "read" still fills delivered_at without regressing status.
            stamp(&mut next, target, at);
        }
    }

    (next != *recipient).then_some(next)
}
