use crate::config::ApiConfig;
use crate::dispatcher::Dispatcher;
use crate::error::GateError;
use crate::notification::{classify, GridEvent, Notification};
use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the notification intake router
pub fn router(state: AppState, config: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/notifications", post(receive_notification))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors_enabled {
        let cors = if config.cors_origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_methods(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(origins).allow_methods(Any)
        };
        router = router.layer(cors);
    }

    router
}

/// Serve the notification API until the process shuts down
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {addr}"))?;

    info!(addr = %addr, "Notification API listening");

    axum::serve(listener, router(state, config))
        .await
        .context("API server error")?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Intake endpoint for blob-created event notifications.
///
/// The event grid delivers a JSON array that must contain exactly one item.
/// Subscription validation pings are answered with the echoed code; events
/// that aren't a CSV landing in an inbound folder are ignored with 204.
async fn receive_notification(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    metrics::counter!("gate.notifications.received").increment(1);

    let item = match body.as_array() {
        Some(items) if items.len() == 1 => items[0].clone(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Expecting only one item in the notification message" })),
            )
                .into_response();
        }
    };

    let event: GridEvent = match serde_json::from_value(item) {
        Ok(event) => event,
        Err(e) => {
            // unparseable payloads are not applicable rather than fatal
            warn!(error = %e, "Unparseable notification payload, ignoring");
            metrics::counter!("gate.notifications.ignored").increment(1);
            return StatusCode::NO_CONTENT.into_response();
        }
    };

    match classify(&event) {
        Ok(Notification::SubscriptionValidation { validation_code }) => {
            info!("Subscription validation event received");
            (
                StatusCode::OK,
                Json(json!({ "validationResponse": validation_code })),
            )
                .into_response()
        }
        Ok(Notification::NotApplicable) => {
            metrics::counter!("gate.notifications.ignored").increment(1);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Notification::FileArrived(descriptor)) => {
            info!(
                customer = %descriptor.customer_name,
                filename = %descriptor.filename,
                "Processing new file"
            );
            let batch_key = descriptor.batch_prefix.clone();
            match state.dispatcher.start_or_signal(descriptor).await {
                Ok(()) => (
                    StatusCode::ACCEPTED,
                    Json(json!({ "batchKey": batch_key })),
                )
                    .into_response(),
                Err(e) => {
                    error!(batch_key = %batch_key, error = %e, "Failed to dispatch notification");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": e.to_string() })),
                    )
                        .into_response()
                }
            }
        }
        Err(e @ GateError::NamingConventionViolation { .. }) => {
            error!(error = %e, "Notification rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Error parsing notification payload");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
