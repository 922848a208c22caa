//! Scheduler engine: the periodic loop that starts due campaigns and sweeps
//! failed recipients for automatic retries.
//!
//! Each tick spawns the due pass and the retry pass as separate tasks, so a
//! slow campaign in one never holds up the other. A pass still running when
//! the next tick fires is skipped for that tick. Campaigns are claimed while
//! being worked on; manual operations on a claimed campaign are refused.
//!
//! The due pass also resumes `running` campaigns that still have pending
//! recipients, which is what a batch cut short by a restart or a failed write
//! looks like.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use relaycast_core::config::SchedulerConfig;
use relaycast_core::error::{RelayError, Result};
use relaycast_core::traits::{CampaignStore, MessageTransport};
use relaycast_core::types::{Campaign, CampaignStatus, RecipientStatus};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::dispatch::{DispatchExecutor, DispatchOutcome, RetryOutcome};
use crate::pacer::SendPacer;
use crate::retry::{RetryMode, select_retryable};

/// Campaigns touched by one synchronous [`CampaignScheduler::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub dispatched: usize,
    pub retried: usize,
}

struct SchedulerInner {
    store: Arc<dyn CampaignStore>,
    executor: DispatchExecutor,
    tick_interval: Duration,
    /// Stop signal of the live loop; `None` while stopped.
    loop_stop: Mutex<Option<Arc<Notify>>>,
    due_running: AtomicBool,
    retry_running: AtomicBool,
    claims: Mutex<HashSet<String>>,
}

/// Cheap to clone; clones share one loop and one claim set.
#[derive(Clone)]
pub struct CampaignScheduler {
    inner: Arc<SchedulerInner>,
}

/// Clears a pass flag on drop.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Releases a campaign claim on drop.
struct CampaignClaim<'a> {
    claims: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for CampaignClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.id);
        }
    }
}

impl CampaignScheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        transport: Arc<dyn MessageTransport>,
        config: &SchedulerConfig,
    ) -> Self {
        let pacer = Arc::new(SendPacer::new(config.send_delay()));
        tracing::debug!(
            "Pacing {} sends {}ms apart per account",
            transport.name(),
            pacer.delay().as_millis()
        );
        let executor = DispatchExecutor::new(store.clone(), transport, pacer, config.send_timeout());
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                executor,
                tick_interval: config.tick_interval(),
                loop_stop: Mutex::new(None),
                due_running: AtomicBool::new(false),
                retry_running: AtomicBool::new(false),
                claims: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn loop_stop(&self) -> MutexGuard<'_, Option<Arc<Notify>>> {
        self.inner.loop_stop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.loop_stop().is_some()
    }

    /// Start the background loop. The first tick fires immediately.
    /// Returns false (and does nothing) if the loop is already running.
    pub fn start(&self) -> bool {
        let stop = {
            let mut slot = self.loop_stop();
            if slot.is_some() {
                tracing::info!("⏰ Campaign scheduler already running; start ignored");
                return false;
            }
            let stop = Arc::new(Notify::new());
            *slot = Some(stop.clone());
            stop
        };

        tracing::info!(
            "⏰ Campaign scheduler started (check every {}s)",
            self.inner.tick_interval.as_secs()
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.inner.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = interval.tick() => scheduler.spawn_passes(),
                }
            }
            tracing::info!("⏹️ Campaign scheduler stopped");
        });
        true
    }

    /// Stop arming new ticks. Passes already in flight run to completion.
    /// Takes effect immediately: a `start()` right after gets a fresh loop.
    pub fn stop(&self) {
        if let Some(stop) = self.loop_stop().take() {
            // notify_one keeps a permit, so the loop exits even if it is
            // not parked on `notified()` yet.
            stop.notify_one();
        }
    }

    fn spawn_passes(&self) {
        let due = self.clone();
        tokio::spawn(async move {
            if let Err(e) = due.run_due_pass().await {
                tracing::error!("❌ Due-campaign pass failed: {e}");
            }
        });
        let retry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = retry.run_retry_pass().await {
                tracing::error!("❌ Auto-retry pass failed: {e}");
            }
        });
    }

    /// Run both passes once and wait for them.
    pub async fn tick(&self) -> TickSummary {
        let (due, retry) = tokio::join!(self.run_due_pass(), self.run_retry_pass());
        TickSummary {
            dispatched: due.unwrap_or_else(|e| {
                tracing::error!("❌ Due-campaign pass failed: {e}");
                0
            }),
            retried: retry.unwrap_or_else(|e| {
                tracing::error!("❌ Auto-retry pass failed: {e}");
                0
            }),
        }
    }

    fn claim(&self, campaign_id: &str) -> Option<CampaignClaim<'_>> {
        let mut claims = self.inner.claims.lock().ok()?;
        claims.insert(campaign_id.to_string()).then(|| CampaignClaim {
            claims: &self.inner.claims,
            id: campaign_id.to_string(),
        })
    }

    /// Resume interrupted `running` campaigns, then start every scheduled
    /// campaign whose time has come.
    pub async fn run_due_pass(&self) -> Result<usize> {
        let Some(_pass) = PassGuard::enter(&self.inner.due_running) else {
            tracing::debug!("Due-campaign pass still running; skipping tick");
            return Ok(0);
        };

        let mut processed = 0;
        for campaign in self.inner.store.list_running_campaigns().await? {
            let Some(_claim) = self.claim(&campaign.id) else {
                continue;
            };
            match self.resume(&campaign).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("❌ Resuming campaign {} failed: {e}", campaign.id),
            }
        }

        let due = self.inner.store.list_due_campaigns(Utc::now()).await?;
        for campaign in due {
            let Some(_claim) = self.claim(&campaign.id) else {
                tracing::debug!("Campaign {} is busy; leaving for next tick", campaign.id);
                continue;
            };
            match self.launch(&campaign, &[CampaignStatus::Scheduled]).await {
                Ok(Some(_)) => processed += 1,
                Ok(None) => {}
                // One bad campaign never stops the rest of the pass.
                Err(e) => tracing::error!("❌ Campaign {} dispatch failed: {e}", campaign.id),
            }
        }
        Ok(processed)
    }

    /// Move a campaign out of `from` and send to its pending recipients.
    /// `None` when another writer moved the campaign first.
    async fn launch(
        &self,
        campaign: &Campaign,
        from: &[CampaignStatus],
    ) -> Result<Option<DispatchOutcome>> {
        let store = &self.inner.store;
        let now = Utc::now();
        let pending = store
            .recipients_by_status(&campaign.id, RecipientStatus::Pending)
            .await?;

        if pending.is_empty() {
            if !store
                .transition_campaign(&campaign.id, from, CampaignStatus::Completed, now)
                .await?
            {
                return Ok(None);
            }
            store.refresh_campaign_counters(&campaign.id, now).await?;
            tracing::info!("✅ Campaign {} has no pending recipients; completed", campaign.id);
            return Ok(Some(DispatchOutcome::default()));
        }

        if !store
            .transition_campaign(&campaign.id, from, CampaignStatus::Running, now)
            .await?
        {
            return Ok(None);
        }
        self.inner.executor.dispatch(campaign, &pending).await.map(Some)
    }

    /// Send to the pending recipients a `running` campaign left behind.
    /// Returns false when there was nothing left to send; the recount then
    /// completes the campaign.
    async fn resume(&self, campaign: &Campaign) -> Result<bool> {
        let store = &self.inner.store;
        let pending = store
            .recipients_by_status(&campaign.id, RecipientStatus::Pending)
            .await?;
        if pending.is_empty() {
            store.refresh_campaign_counters(&campaign.id, Utc::now()).await?;
            return Ok(false);
        }

        tracing::warn!(
            "⚠️ Campaign {} was interrupted with {} recipients pending; resuming",
            campaign.id,
            pending.len()
        );
        self.inner.executor.dispatch(campaign, &pending).await?;
        Ok(true)
    }

    /// Sweep auto-retry campaigns for failed recipients past their cooldown.
    pub async fn run_retry_pass(&self) -> Result<usize> {
        let Some(_pass) = PassGuard::enter(&self.inner.retry_running) else {
            tracing::debug!("Auto-retry pass still running; skipping tick");
            return Ok(0);
        };

        let store = &self.inner.store;
        let mut retried = 0;
        for campaign in store.list_auto_retry_campaigns().await? {
            if !campaign.retry.auto_retry_enabled || !campaign.status.accepts_retry_sweep() {
                continue;
            }
            let Some(_claim) = self.claim(&campaign.id) else {
                continue;
            };

            let selection = match select_retryable(store.as_ref(), &campaign, RetryMode::Auto, Utc::now()).await {
                Ok(selection) => selection,
                Err(e) => {
                    tracing::error!("❌ Retry selection for campaign {} failed: {e}", campaign.id);
                    continue;
                }
            };
            if selection.eligible.is_empty() {
                continue;
            }

            match self
                .inner
                .executor
                .retry(&campaign, &selection.eligible, selection.exhausted)
                .await
            {
                Ok(_) => retried += 1,
                Err(e) => tracing::error!("❌ Auto-retry for campaign {} failed: {e}", campaign.id),
            }
        }
        Ok(retried)
    }

    /// Operator-triggered retry: ignores the cooldown, keeps the cap.
    pub async fn trigger_manual_retry(&self, campaign_id: &str) -> Result<RetryOutcome> {
        let campaign = self.load(campaign_id).await?;
        let _claim = self
            .claim(campaign_id)
            .ok_or_else(|| RelayError::CampaignBusy(campaign_id.to_string()))?;

        let selection = select_retryable(
            self.inner.store.as_ref(),
            &campaign,
            RetryMode::Manual,
            Utc::now(),
        )
        .await?;
        tracing::info!(
            "🔁 Manual retry for campaign {}: {} eligible, {} at cap",
            campaign_id,
            selection.eligible.len(),
            selection.exhausted
        );
        self.inner
            .executor
            .retry(&campaign, &selection.eligible, selection.exhausted)
            .await
    }

    /// Send a draft or scheduled campaign right away.
    pub async fn dispatch_now(&self, campaign_id: &str) -> Result<DispatchOutcome> {
        let campaign = self.load(campaign_id).await?;
        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
            return Err(RelayError::InvalidState(format!(
                "campaign {campaign_id} is {}, expected draft or scheduled",
                campaign.status
            )));
        }
        let _claim = self
            .claim(campaign_id)
            .ok_or_else(|| RelayError::CampaignBusy(campaign_id.to_string()))?;

        self.launch(&campaign, &[CampaignStatus::Draft, CampaignStatus::Scheduled])
            .await?
            .ok_or_else(|| RelayError::InvalidState(format!("campaign {campaign_id} changed state concurrently")))
    }

    async fn load(&self, campaign_id: &str) -> Result<Campaign> {
        self.inner
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| RelayError::CampaignNotFound(campaign_id.to_string()))
    }
}
