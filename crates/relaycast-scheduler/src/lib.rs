//! # Relaycast Scheduler
//!
//! Campaign engine: sends template messages in bulk, reconciles webhook
//! delivery statuses, and retries failed recipients within a bounded budget.
//!
//! ## Design Principles
//! - SQLite persistence, survives restarts
//! - Recipient rows are only written through compare-and-set transitions
//! - Campaign counters are recounted, never incremented
//! - Tokio timers only, idle between ticks
//!
//! ## Architecture
//! ```text
//! CampaignScheduler (tokio interval)
//!   ├── due pass:   scheduled + due → running → DispatchExecutor::dispatch
//!   ├── retry pass: auto_retry campaigns → select_retryable → DispatchExecutor::retry
//!   └── manual:     trigger_manual_retry / dispatch_now
//!
//! DispatchExecutor
//!   ├── template::resolve_for_recipient → TemplateMessage
//!   ├── SendPacer (per-account spacing) → MessageTransport
//!   └── recipient::{mark_sent, retry_failed, ...} → CampaignStore::apply_transition
//!
//! Webhook → StatusReconciler::apply_status_event
//!   └── recipient::apply_delivery_event → apply_transition → refresh_campaign_counters
//! ```

pub mod dispatch;
pub mod engine;
pub mod pacer;
pub mod persistence;
pub mod reconciler;
pub mod recipient;
pub mod retry;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatch::{DispatchExecutor, DispatchOutcome, RetryOutcome};
pub use engine::CampaignScheduler;
pub use pacer::SendPacer;
pub use persistence::CampaignDb;
pub use reconciler::{ReconcileOutcome, StatusReconciler};
pub use retry::{RetryMode, RetryPolicy, select_retryable};
