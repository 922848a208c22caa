//! Shared fakes for scheduler tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycast_core::error::{RelayError, Result};
use relaycast_core::traits::{CampaignStore, MessageTransport};
use relaycast_core::types::{
    BusinessAccount, Campaign, CampaignCounters, CampaignRecipient, CampaignStatus,
    RecipientStatus, RecipientTransition, TemplateMessage,
};

use crate::persistence::CampaignDb;

/// Transport that records every message and fails for chosen numbers.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<TemplateMessage>>,
    pub failing_numbers: Mutex<HashSet<String>>,
    pub body: Option<String>,
    pub body_fetches: AtomicUsize,
    /// Sleep before answering, to exercise the send timeout.
    pub latency: Option<Duration>,
    pub counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn with_body(body: &str) -> Self {
        Self { body: Some(body.to_string()), ..Self::default() }
    }

    pub fn fail_for(&self, phone: &str) {
        self.failing_numbers.lock().unwrap().insert(phone.to_string());
    }

    pub fn recover(&self, phone: &str) {
        self.failing_numbers.lock().unwrap().remove(phone);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_to(&self, phone: &str) -> Vec<TemplateMessage> {
        self.sent.lock().unwrap().iter().filter(|m| m.to == phone).cloned().collect()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    fn name(&self) -> &str { "recording" }

    async fn send_template_message(&self, _account: &BusinessAccount, message: &TemplateMessage) -> Result<String> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.sent.lock().unwrap().push(message.clone());
        if self.failing_numbers.lock().unwrap().contains(&message.to) {
            return Err(RelayError::Transport(format!("rejected {}", message.to)));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("wamid.{n}"))
    }

    async fn fetch_template_body(&self, _account: &BusinessAccount, name: &str, _language: &str) -> Result<String> {
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        self.body
            .clone()
            .ok_or_else(|| RelayError::Transport(format!("template '{name}' not found")))
    }
}

pub fn account() -> BusinessAccount {
    BusinessAccount {
        id: "acct-1".into(),
        tenant_id: "t1".into(),
        phone_number_id: "1055".into(),
        waba_id: "2077".into(),
        access_token: "EAAG".into(),
    }
}

/// In-memory store holding the test account, `campaign`, and one pending
/// recipient per `(phone, name)` entry.
pub async fn seeded_store(
    mut campaign: Campaign,
    recipients: &[(&str, Option<&str>)],
) -> (CampaignDb, Campaign, Vec<CampaignRecipient>) {
    let db = CampaignDb::open_in_memory().unwrap();
    db.upsert_business_account(&account()).await.unwrap();
    campaign.account_id = account().id;
    db.insert_campaign(&campaign).await.unwrap();
    let rows: Vec<_> = recipients
        .iter()
        .map(|(phone, name)| CampaignRecipient::new(&campaign.id, phone, *name))
        .collect();
    db.insert_recipients(&rows).await.unwrap();
    (db, campaign, rows)
}

/// Store whose next recipient write fails once with a database error.
pub struct FlakyStore {
    pub db: CampaignDb,
    pub fail_next_write: AtomicBool,
}

impl FlakyStore {
    pub fn failing_once(db: CampaignDb) -> Self {
        Self { db, fail_next_write: AtomicBool::new(true) }
    }
}

#[async_trait]
impl CampaignStore for FlakyStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.db.insert_campaign(campaign).await
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<Campaign>> {
        self.db.get_campaign(id).await
    }

    async fn transition_campaign(
        &self,
        id: &str,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.db.transition_campaign(id, from, to, at).await
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        self.db.list_due_campaigns(now).await
    }

    async fn list_running_campaigns(&self) -> Result<Vec<Campaign>> {
        self.db.list_running_campaigns().await
    }

    async fn list_auto_retry_campaigns(&self) -> Result<Vec<Campaign>> {
        self.db.list_auto_retry_campaigns().await
    }

    async fn insert_recipients(&self, recipients: &[CampaignRecipient]) -> Result<()> {
        self.db.insert_recipients(recipients).await
    }

    async fn get_recipient(&self, id: &str) -> Result<Option<CampaignRecipient>> {
        self.db.get_recipient(id).await
    }

    async fn recipients_by_status(
        &self,
        campaign_id: &str,
        status: RecipientStatus,
    ) -> Result<Vec<CampaignRecipient>> {
        self.db.recipients_by_status(campaign_id, status).await
    }

    async fn retry_eligible_recipients(
        &self,
        campaign_id: &str,
        max_retries: u32,
        cooldown_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignRecipient>> {
        self.db.retry_eligible_recipients(campaign_id, max_retries, cooldown_minutes, now).await
    }

    async fn recipient_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<CampaignRecipient>> {
        self.db.recipient_by_provider_message_id(provider_message_id).await
    }

    async fn apply_transition(&self, transition: &RecipientTransition) -> Result<bool> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Database("disk I/O error".into()));
        }
        self.db.apply_transition(transition).await
    }

    async fn refresh_campaign_counters(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CampaignCounters> {
        self.db.refresh_campaign_counters(campaign_id, now).await
    }

    async fn get_business_account(&self, id: &str) -> Result<Option<BusinessAccount>> {
        self.db.get_business_account(id).await
    }

    async fn upsert_business_account(&self, account: &BusinessAccount) -> Result<()> {
        self.db.upsert_business_account(account).await
    }
}
