//! WhatsApp Business Cloud API transport.
//!
//! Sends approved template messages and looks up template bodies.
//! Credentials come per call from the campaign's business account, so one
//! transport instance serves every tenant.

use async_trait::async_trait;
use relaycast_core::config::WhatsAppConfig;
use relaycast_core::error::{RelayError, Result};
use relaycast_core::traits::MessageTransport;
use relaycast_core::types::{BusinessAccount, TemplateMessage};
use std::time::Duration;

/// WhatsApp Cloud API transport.
pub struct WhatsAppTransport {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppTransport {
    pub fn new(config: WhatsAppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.api_version,
            path
        )
    }
}

/// Build the `/messages` request body for a template send.
pub fn build_template_payload(message: &TemplateMessage) -> serde_json::Value {
    let mut components = Vec::new();

    if let Some(link) = &message.header_media {
        components.push(serde_json::json!({
            "type": "header",
            "parameters": [{ "type": "image", "image": { "link": link } }]
        }));
    }

    if let Some(params) = &message.params {
        let parameters: Vec<serde_json::Value> = params
            .iter()
            .map(|p| {
                let mut v = serde_json::json!({ "type": "text", "text": p.value });
                if let Some(name) = &p.parameter_name {
                    v["parameter_name"] = serde_json::Value::String(name.clone());
                }
                v
            })
            .collect();
        components.push(serde_json::json!({ "type": "body", "parameters": parameters }));
    }

    let mut template = serde_json::json!({
        "name": message.template_name,
        "language": { "code": message.language },
    });
    if !components.is_empty() {
        template["components"] = serde_json::Value::Array(components);
    }

    serde_json::json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": message.to,
        "type": "template",
        "template": template,
    })
}

/// Pull the BODY text out of a `message_templates` listing.
/// Prefers the entry in `language`, falls back to the first match.
pub fn extract_body_text(listing: &serde_json::Value, language: &str) -> Option<String> {
    let templates = listing["data"].as_array()?;
    let chosen = templates
        .iter()
        .find(|t| t["language"].as_str() == Some(language))
        .or_else(|| templates.first())?;

    chosen["components"]
        .as_array()?
        .iter()
        .find(|c| c["type"].as_str().is_some_and(|t| t.eq_ignore_ascii_case("body")))
        .and_then(|c| c["text"].as_str())
        .map(str::to_string)
}

/// Graph API error bodies look like `{"error": {"message": ..., "code": ...}}`.
fn describe_error(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    format!("WhatsApp API error {status}: {detail}")
}

#[async_trait]
impl MessageTransport for WhatsAppTransport {
    fn name(&self) -> &str { "whatsapp" }

    async fn send_template_message(
        &self,
        account: &BusinessAccount,
        message: &TemplateMessage,
    ) -> Result<String> {
        let url = self.endpoint(&format!("{}/messages", account.phone_number_id));
        let body = build_template_payload(message);

        let response = self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", account.access_token))
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("WhatsApp API request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RelayError::Transport(describe_error(status, &error_text)));
        }

        let result: serde_json::Value = response.json().await
            .map_err(|e| RelayError::Transport(format!("Invalid WhatsApp response: {e}")))?;

        let msg_id = result["messages"][0]["id"]
            .as_str()
            .ok_or_else(|| RelayError::Transport("WhatsApp response missing message id".into()))?
            .to_string();

        tracing::debug!("WhatsApp template '{}' sent: {} → {}", message.template_name, msg_id, message.to);
        Ok(msg_id)
    }

    async fn fetch_template_body(
        &self,
        account: &BusinessAccount,
        template_name: &str,
        language: &str,
    ) -> Result<String> {
        let url = self.endpoint(&format!("{}/message_templates", account.waba_id));

        let response = self.client
            .get(&url)
            .header("Authorization", format!("Bearer {}", account.access_token))
            .query(&[("name", template_name), ("fields", "name,language,components")])
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("WhatsApp template lookup failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RelayError::Transport(describe_error(status, &error_text)));
        }

        let listing: serde_json::Value = response.json().await
            .map_err(|e| RelayError::Transport(format!("Invalid template listing: {e}")))?;

        extract_body_text(&listing, language).ok_or_else(|| {
            RelayError::Transport(format!("Template '{template_name}' ({language}) has no body"))
        })
    }
}
