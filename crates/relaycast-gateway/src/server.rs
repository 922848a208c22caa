//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use relaycast_core::config::{GatewayConfig, WhatsAppConfig};
use relaycast_scheduler::{CampaignScheduler, StatusReconciler};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    /// Verify token and app secret for the webhook.
    pub whatsapp: WhatsAppConfig,
    pub scheduler: CampaignScheduler,
    pub reconciler: Arc<StatusReconciler>,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(super::routes::health_check))
        // Meta webhook: GET handshake, POST status deliveries
        .route(
            "/webhook/whatsapp",
            get(super::routes::whatsapp_webhook_verify).post(super::routes::whatsapp_webhook),
        )
        // Campaign admin
        .route("/api/v1/campaigns/{id}/retry", post(super::routes::retry_campaign))
        .route("/api/v1/campaigns/{id}/dispatch", post(super::routes::dispatch_campaign))
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server and serve until the listener fails.
pub async fn start(config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
