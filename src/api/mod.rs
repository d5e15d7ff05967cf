//! HTTP surface: health and the Stripe webhook receiver.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::billing::{BillingError, IngestOutcome};
use crate::core::shared::error::ApiError;
use crate::core::shared::state::AppState;

pub const STRIPE_SIGNATURE_HEADER: &str = "Stripe-Signature";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/stripe", post(stripe_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let db_ok = state.conn.get().is_ok();
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "service": "affiliate-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok,
            "cache": state.cache.is_enabled(),
        })),
    )
}

/// Accepts a raw Stripe event. Events that fail to apply are stored and
/// acknowledged; the retry sweeper owns them from then on.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestOutcome>, ApiError> {
    let payload = std::str::from_utf8(&body)
        .map_err(|_| BillingError::InvalidState("webhook body is not UTF-8".into()))?;
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let outcome = state.webhooks.ingest(payload, signature).await?;
    if let IngestOutcome::Deferred { webhook_event_id, error } = &outcome {
        warn!("Webhook event {} deferred: {}", webhook_event_id, error);
    }
    Ok(Json(outcome))
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
