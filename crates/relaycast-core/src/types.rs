//! Domain model: campaigns, recipients, accounts and webhook events.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "running" => Some(CampaignStatus::Running),
            "paused" => Some(CampaignStatus::Paused),
            "completed" => Some(CampaignStatus::Completed),
            "failed" => Some(CampaignStatus::Failed),
            _ => None,
        }
    }

    /// Completed, paused and failed campaigns are still swept for retries.
    pub fn accepts_retry_sweep(&self) -> bool {
        !matches!(
            self,
            CampaignStatus::Running | CampaignStatus::Scheduled | CampaignStatus::Draft
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Delivered => "delivered",
            RecipientStatus::Read => "read",
            RecipientStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecipientStatus::Pending),
            "sent" => Some(RecipientStatus::Sent),
            "delivered" => Some(RecipientStatus::Delivered),
            "read" => Some(RecipientStatus::Read),
            "failed" => Some(RecipientStatus::Failed),
            _ => None,
        }
    }

    /// Position on the delivery lattice. `Failed` sits outside it.
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            RecipientStatus::Pending => Some(0),
            RecipientStatus::Sent => Some(1),
            RecipientStatus::Delivered => Some(2),
            RecipientStatus::Read => Some(3),
            RecipientStatus::Failed => None,
        }
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Campaign-level template variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Literal(String),
    /// Substituted with the recipient's name (or "" when absent).
    RecipientName,
}

impl From<&str> for VariableValue {
    fn from(s: &str) -> Self {
        VariableValue::Literal(s.to_string())
    }
}

/// Retry policy carried by each campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_minutes: u32,
    pub auto_retry_enabled: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_minutes: 30,
            auto_retry_enabled: false,
        }
    }
}

/// Aggregate counters cached on the campaign row.
///
/// Always derived from the recipient set; a recipient counts toward every
/// counter at or below its current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total_recipients: u32,
    pub sent_count: u32,
    pub delivered_count: u32,
    pub read_count: u32,
    pub failed_count: u32,
    pub pending_count: u32,
}

impl CampaignCounters {
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = RecipientStatus>,
    {
        let mut c = Self::default();
        for status in statuses {
            c.total_recipients += 1;
            match status {
                RecipientStatus::Pending => c.pending_count += 1,
                RecipientStatus::Failed => c.failed_count += 1,
                RecipientStatus::Sent => c.sent_count += 1,
                RecipientStatus::Delivered => {
                    c.sent_count += 1;
                    c.delivered_count += 1;
                }
                RecipientStatus::Read => {
                    c.sent_count += 1;
                    c.delivered_count += 1;
                    c.read_count += 1;
                }
            }
        }
        c
    }
}

/// A bulk-send job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub template_name: String,
    pub template_language: String,
    pub template_variables: BTreeMap<String, VariableValue>,
    pub header_media: Option<String>,
    /// Body text cached at campaign setup; used to order variables.
    pub template_body: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: CampaignCounters,
    pub retry: RetrySettings,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new campaign in `draft`.
    pub fn new(tenant_id: &str, account_id: &str, template_name: &str, language: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            account_id: account_id.to_string(),
            template_name: template_name.to_string(),
            template_language: language.to_string(),
            template_variables: BTreeMap::new(),
            header_media: None,
            template_body: None,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            counters: CampaignCounters::default(),
            retry: RetrySettings::default(),
            created_at: Utc::now(),
        }
    }

    /// Set a future send time; moves the campaign to `scheduled`.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self.status = CampaignStatus::Scheduled;
        self
    }
}

/// One target phone number within a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub id: String,
    pub campaign_id: String,
    pub phone_number: String,
    pub name: Option<String>,
    /// Overrides merged over campaign variables; these win on conflict.
    pub variables: BTreeMap<String, String>,
    pub status: RecipientStatus,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl CampaignRecipient {
    pub fn new(campaign_id: &str, phone_number: &str, name: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.to_string(),
            phone_number: phone_number.to_string(),
            name: name.map(str::to_string),
            variables: BTreeMap::new(),
            status: RecipientStatus::Pending,
            provider_message_id: None,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
        }
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }
}

/// Compare-and-set write of a recipient's mutable columns.
///
/// Applied only if the stored row still has `expected_status` and
/// `expected_retry_count`; otherwise the store reports a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientTransition {
    pub recipient_id: String,
    pub expected_status: RecipientStatus,
    pub expected_retry_count: u32,
    pub next: CampaignRecipient,
}

impl RecipientTransition {
    pub fn between(before: &CampaignRecipient, next: CampaignRecipient) -> Self {
        Self {
            recipient_id: before.id.clone(),
            expected_status: before.status,
            expected_retry_count: before.retry_count,
            next,
        }
    }
}

/// Business account credentials for the outbound transport (read-only here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessAccount {
    pub id: String,
    pub tenant_id: String,
    /// WhatsApp phone number id used for `/messages`.
    pub phone_number_id: String,
    /// WhatsApp Business Account id used for template lookup.
    pub waba_id: String,
    pub access_token: String,
}

/// One ordered template body parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,
}

impl TemplateParam {
    pub fn positional(value: &str) -> Self {
        Self { value: value.to_string(), parameter_name: None }
    }

    pub fn named(name: &str, value: &str) -> Self {
        Self { value: value.to_string(), parameter_name: Some(name.to_string()) }
    }
}

/// An outbound template send.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateMessage {
    pub to: String,
    pub template_name: String,
    pub language: String,
    pub header_media: Option<String>,
    /// `None` means "no body parameters".
    pub params: Option<Vec<TemplateParam>>,
}

/// Delivery status reported by a provider webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn as_recipient_status(&self) -> RecipientStatus {
        match self {
            DeliveryStatus::Sent => RecipientStatus::Sent,
            DeliveryStatus::Delivered => RecipientStatus::Delivered,
            DeliveryStatus::Read => RecipientStatus::Read,
            DeliveryStatus::Failed => RecipientStatus::Failed,
        }
    }
}

/// Provider error attached to a `failed` status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub code: Option<i64>,
    pub title: String,
    pub detail: Option<String>,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.title)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// An inbound delivery-status event (at-least-once, unordered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    /// Provider event time in Unix seconds; `None` when missing or unparseable.
    #[serde(default)]
    pub timestamp_secs: Option<i64>,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

impl StatusEvent {
    pub fn new(provider_message_id: &str, status: DeliveryStatus, timestamp_secs: i64) -> Self {
        Self {
            provider_message_id: provider_message_id.to_string(),
            status,
            timestamp_secs: Some(timestamp_secs),
            errors: Vec::new(),
        }
    }

    /// Event without a usable provider timestamp.
    pub fn untimed(provider_message_id: &str, status: DeliveryStatus) -> Self {
        Self { timestamp_secs: None, ..Self::new(provider_message_id, status, 0) }
    }

    /// Event time, or `Utc::now()` when the provider sent none or garbage.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp_secs
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }

    /// Errors joined into one line for `error_message`.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
