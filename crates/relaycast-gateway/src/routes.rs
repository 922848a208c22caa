//! API route handlers for the gateway.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use relaycast_core::error::RelayError;
use relaycast_core::types::{DeliveryStatus, StatusError, StatusEvent};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

use crate::server::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relaycast",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler_running": state.scheduler.is_running(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// WhatsApp webhook verification (GET). Meta sends this once when the
/// callback URL is registered.
pub async fn whatsapp_webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let mode = params.get("hub.mode").map(|s| s.as_str()).unwrap_or("");
    let token = params.get("hub.verify_token").map(|s| s.as_str()).unwrap_or("");
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    let expected = &state.whatsapp.webhook_verify_token;
    if mode == "subscribe" && !expected.is_empty() && token == expected {
        tracing::info!("WhatsApp webhook verified");
        (StatusCode::OK, challenge).into_response()
    } else {
        tracing::warn!("[webhook] Verification rejected (mode={mode})");
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Check an `X-Hub-Signature-256: sha256=<hex>` header against the body.
pub fn verify_signature(app_secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(bytes) = header
        .and_then(|h| h.strip_prefix("sha256="))
        .and_then(decode_hex)
    else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&bytes).is_ok()
}

fn parse_status_error(e: &serde_json::Value) -> StatusError {
    StatusError {
        code: e["code"].as_i64(),
        title: e["title"]
            .as_str()
            .or_else(|| e["message"].as_str())
            .unwrap_or("Unknown error")
            .to_string(),
        detail: e["error_data"]["details"].as_str().map(str::to_string),
    }
}

/// Pull delivery statuses out of a Cloud API webhook payload.
///
/// Statuses this engine does not track (e.g. `deleted`) and entries without a
/// message id are skipped. Inbound messages in the same payload are ignored.
pub fn parse_status_events(payload: &serde_json::Value) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    let Some(entries) = payload["entry"].as_array() else {
        return events;
    };

    for entry in entries {
        let Some(changes) = entry["changes"].as_array() else { continue };
        for change in changes {
            let Some(statuses) = change["value"]["statuses"].as_array() else { continue };
            for st in statuses {
                let Some(id) = st["id"].as_str() else { continue };
                let Some(status) = st["status"].as_str().and_then(DeliveryStatus::parse) else {
                    tracing::debug!("[webhook] Skipping status '{}' for {id}", st["status"]);
                    continue;
                };
                // Meta sends the timestamp as a decimal string. Without one
                // the event is stamped when it is applied.
                let timestamp = st["timestamp"]
                    .as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .or_else(|| st["timestamp"].as_i64());

                let mut event = match timestamp {
                    Some(secs) => StatusEvent::new(id, status, secs),
                    None => StatusEvent::untimed(id, status),
                };
                if let Some(errors) = st["errors"].as_array() {
                    event.errors = errors.iter().map(parse_status_error).collect();
                }
                events.push(event);
            }
        }
    }
    events
}

/// WhatsApp webhook handler (POST): delivery status callbacks.
///
/// Every well-signed delivery is answered 200, even when individual events
/// fail to apply, so Meta does not keep redelivering the batch.
pub async fn whatsapp_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = &state.whatsapp.app_secret;
    if !secret.is_empty() {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            tracing::warn!("[webhook] Invalid signature on status delivery");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"ok": false, "error": "Invalid webhook signature"})),
            )
                .into_response();
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ok": false, "error": format!("Invalid JSON: {e}")})),
            )
                .into_response();
        }
    };

    let events = parse_status_events(&payload);
    let mut applied = 0;
    for event in &events {
        match state.reconciler.apply_status_event(event).await {
            Ok(relaycast_scheduler::ReconcileOutcome::Applied(_)) => applied += 1,
            Ok(_) => {}
            Err(e) => tracing::error!(
                "[webhook] Failed to apply status for {}: {e}",
                event.provider_message_id
            ),
        }
    }

    Json(serde_json::json!({
        "ok": true,
        "received": events.len(),
        "applied": applied,
    }))
    .into_response()
}

fn error_response(e: RelayError) -> Response {
    let status = match &e {
        RelayError::CampaignNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::CampaignBusy(_) | RelayError::InvalidState(_) => StatusCode::CONFLICT,
        RelayError::AccountNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"ok": false, "error": e.to_string()}))).into_response()
}

fn ok_with<T: serde::Serialize>(outcome: &T) -> Response {
    let mut body = serde_json::to_value(outcome).unwrap_or_default();
    body["ok"] = serde_json::Value::Bool(true);
    Json(body).into_response()
}

/// Manual retry: resend to failed recipients below the cap, ignoring cooldown.
pub async fn retry_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.trigger_manual_retry(&id).await {
        Ok(outcome) => ok_with(&outcome),
        Err(e) => error_response(e),
    }
}

/// Send a draft or scheduled campaign now.
pub async fn dispatch_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scheduler.dispatch_now(&id).await {
        Ok(outcome) => ok_with(&outcome),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use async_trait::async_trait;
    use relaycast_core::config::{SchedulerConfig, WhatsAppConfig};
    use relaycast_core::traits::{CampaignStore, MessageTransport};
    use relaycast_core::types::{
        BusinessAccount, Campaign, CampaignRecipient, CampaignStatus, RecipientStatus,
        RecipientTransition, TemplateMessage,
    };
    use relaycast_scheduler::{CampaignDb, CampaignScheduler, StatusReconciler};
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl MessageTransport for AcceptAll {
        fn name(&self) -> &str { "accept-all" }

        async fn send_template_message(&self, _: &BusinessAccount, m: &TemplateMessage) -> relaycast_core::Result<String> {
            Ok(format!("wamid.retry.{}", m.to))
        }

        async fn fetch_template_body(&self, _: &BusinessAccount, _: &str, _: &str) -> relaycast_core::Result<String> {
            Ok("Hello".into())
        }
    }

    fn test_state(app_secret: &str) -> (Arc<AppState>, Arc<dyn CampaignStore>) {
        let store: Arc<dyn CampaignStore> = Arc::new(CampaignDb::open_in_memory().unwrap());
        let sched_config = SchedulerConfig { send_delay_ms: 0, ..SchedulerConfig::default() };
        let state = AppState {
            whatsapp: WhatsAppConfig {
                webhook_verify_token: "verify-me".into(),
                app_secret: app_secret.into(),
                ..WhatsAppConfig::default()
            },
            scheduler: CampaignScheduler::new(store.clone(), Arc::new(AcceptAll), &sched_config),
            reconciler: Arc::new(StatusReconciler::new(store.clone(), 3)),
            start_time: std::time::Instant::now(),
        };
        (Arc::new(state), store)
    }

    /// Campaign with one recipient already sent as `wamid.A` and one failed.
    async fn seed(store: &Arc<dyn CampaignStore>) -> (Campaign, CampaignRecipient, CampaignRecipient) {
        store
            .upsert_business_account(&BusinessAccount {
                id: "acct-1".into(),
                tenant_id: "t1".into(),
                phone_number_id: "1055".into(),
                waba_id: "2077".into(),
                access_token: "EAAG".into(),
            })
            .await
            .unwrap();
        let mut c = Campaign::new("t1", "acct-1", "promo", "en_US");
        c.status = CampaignStatus::Running;
        store.insert_campaign(&c).await.unwrap();

        let a = CampaignRecipient::new(&c.id, "628100", None);
        let b = CampaignRecipient::new(&c.id, "628101", None);
        store.insert_recipients(&[a.clone(), b.clone()]).await.unwrap();

        let mut sent = a.clone();
        sent.status = RecipientStatus::Sent;
        sent.provider_message_id = Some("wamid.A".into());
        store.apply_transition(&RecipientTransition::between(&a, sent.clone())).await.unwrap();
        let mut failed = b.clone();
        failed.status = RecipientStatus::Failed;
        failed.error_message = Some("rejected".into());
        store.apply_transition(&RecipientTransition::between(&b, failed.clone())).await.unwrap();
        store.refresh_campaign_counters(&c.id, chrono::Utc::now()).await.unwrap();
        (c, sent, failed)
    }

    fn status_payload(id: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "2077",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "statuses": [{
                            "id": id,
                            "status": status,
                            "timestamp": "1700000100",
                            "recipient_id": "628100"
                        }]
                    }
                }]
            }]
        })
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let hex: String = mac.finalize().into_bytes().iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    // ---- Verification handshake ----

    #[tokio::test]
    async fn test_verify_handshake() {
        let (state, _) = test_state("");
        let params: HashMap<String, String> = [
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "verify-me"),
            ("hub.challenge", "1158201444"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let ok = whatsapp_webhook_verify(Query(params.clone()), State(state.clone())).await;
        assert_eq!(ok.status(), StatusCode::OK);

        let mut wrong = params;
        wrong.insert("hub.verify_token".into(), "nope".into());
        let denied = whatsapp_webhook_verify(Query(wrong), State(state)).await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    // ---- Signatures & parsing ----

    #[test]
    fn test_signature_check() {
        let body = br#"{"entry":[]}"#;
        let header = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, Some(&header)));
        assert!(!verify_signature("other", body, Some(&header)));
        assert!(!verify_signature("s3cret", b"tampered", Some(&header)));
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("sha256=zz")));
        assert!(!verify_signature("s3cret", body, Some("md5=abcd")));
    }

    #[test]
    fn test_parse_status_events() {
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{"from": "628100", "text": {"body": "hi"}}],
                        "statuses": [
                            {"id": "wamid.A", "status": "read", "timestamp": "1700000200"},
                            {"id": "wamid.B", "status": "deleted", "timestamp": "1700000200"},
                            {"id": "wamid.D", "status": "delivered", "timestamp": "soon"},
                            {"status": "sent", "timestamp": "1700000200"},
                            {"id": "wamid.C", "status": "failed", "timestamp": 1700000300_i64,
                             "errors": [{"code": 131026, "title": "Message undeliverable",
                                         "error_data": {"details": "Recipient not on WhatsApp"}}]}
                        ]
                    }
                }]
            }]
        });
        let events = parse_status_events(&payload);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].status, DeliveryStatus::Read);
        assert_eq!(events[0].timestamp_secs, Some(1_700_000_200));
        // Unparseable timestamp: no epoch-zero stamp, applied at receipt time.
        assert_eq!(events[1].timestamp_secs, None);
        assert!(events[1].timestamp().timestamp() > 1_700_000_000);
        assert_eq!(events[2].timestamp_secs, Some(1_700_000_300));
        assert_eq!(
            events[2].error_summary(),
            "[131026] Message undeliverable: Recipient not on WhatsApp"
        );
        assert!(parse_status_events(&serde_json::json!({})).is_empty());
    }

    // ---- Status webhook ----

    #[tokio::test]
    async fn test_webhook_applies_status() {
        let (state, store) = test_state("");
        let (c, sent, _) = seed(&store).await;

        let body = serde_json::to_vec(&status_payload("wamid.A", "delivered")).unwrap();
        let resp = whatsapp_webhook(State(state.clone()), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let r = store.get_recipient(&sent.id).await.unwrap().unwrap();
        assert_eq!(r.status, RecipientStatus::Delivered);
        let campaign = store.get_campaign(&c.id).await.unwrap().unwrap();
        assert_eq!(campaign.counters.delivered_count, 1);

        // Unknown ids are acknowledged too.
        let body = serde_json::to_vec(&status_payload("wamid.ghost", "read")).unwrap();
        let resp = whatsapp_webhook(State(state), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_without_timestamp_stamps_receipt_time() {
        let (state, store) = test_state("");
        let (_, sent, _) = seed(&store).await;

        let mut payload = status_payload("wamid.A", "read");
        payload["entry"][0]["changes"][0]["value"]["statuses"][0]
            .as_object_mut()
            .unwrap()
            .remove("timestamp");
        let before = chrono::Utc::now();
        let body = serde_json::to_vec(&payload).unwrap();
        let resp = whatsapp_webhook(State(state), HeaderMap::new(), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let r = store.get_recipient(&sent.id).await.unwrap().unwrap();
        assert_eq!(r.status, RecipientStatus::Read);
        assert!(r.read_at.unwrap() >= before - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced_when_configured() {
        let (state, store) = test_state("s3cret");
        let (_, sent, _) = seed(&store).await;
        let body = serde_json::to_vec(&status_payload("wamid.A", "read")).unwrap();

        let unsigned = whatsapp_webhook(State(state.clone()), HeaderMap::new(), Bytes::from(body.clone())).await;
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            store.get_recipient(&sent.id).await.unwrap().unwrap().status,
            RecipientStatus::Sent
        );

        let mut headers = HeaderMap::new();
        headers.insert("X-Hub-Signature-256", sign("s3cret", &body).parse().unwrap());
        let signed = whatsapp_webhook(State(state), headers, Bytes::from(body)).await;
        assert_eq!(signed.status(), StatusCode::OK);
        assert_eq!(
            store.get_recipient(&sent.id).await.unwrap().unwrap().status,
            RecipientStatus::Read
        );
    }

    #[tokio::test]
    async fn test_webhook_rejects_malformed_json() {
        let (state, _) = test_state("");
        let resp = whatsapp_webhook(State(state), HeaderMap::new(), Bytes::from_static(b"{not json")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // ---- Admin API ----

    #[tokio::test]
    async fn test_manual_retry_endpoint() {
        let (state, store) = test_state("");
        let (c, _, failed) = seed(&store).await;

        let resp = retry_campaign(State(state.clone()), Path(c.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let r = store.get_recipient(&failed.id).await.unwrap().unwrap();
        assert_eq!(r.status, RecipientStatus::Sent);
        assert_eq!(r.provider_message_id.as_deref(), Some("wamid.retry.628101"));

        let missing = retry_campaign(State(state), Path("nope".into())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dispatch_endpoint_rejects_running_campaign() {
        let (state, store) = test_state("");
        let (c, _, _) = seed(&store).await;
        let resp = dispatch_campaign(State(state), Path(c.id)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_router_health() {
        let (state, _) = test_state("");
        let app = build_router((*state).clone());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
