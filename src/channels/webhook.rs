//! Inbound webhook + small admin REST surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::lead::Stage;
use crate::media::InboundEvent;
use crate::pipeline::orchestrator::{Orchestrator, TurnOutcome};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router for the webhook and lead admin routes.
pub fn webhook_routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(receive_event))
        .route("/api/leads/{id}", get(get_lead))
        .route("/api/leads/{id}/reset", post(reset_lead))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-agent",
        "in_flight": state.orchestrator.gate().in_flight(),
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// Acknowledge immediately; the turn runs on its own task.
async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> impl IntoResponse {
    if event.contact_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "contact_id is required"})),
        );
    }

    debug!(contact = %event.contact_id, kind = %event.kind, "Webhook event received");
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        let contact = event.contact_id.clone();
        if let TurnOutcome::Failed(reason) = orchestrator.handle_event(event).await {
            warn!(contact = %contact, error = %reason, "Webhook turn failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "accepted"})),
    )
}

// ── Lead admin ──────────────────────────────────────────────────────────

async fn get_lead(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.orchestrator.store().get_lead(&id).await {
        Ok(Some(lead)) => (StatusCode::OK, Json(serde_json::json!(lead))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Lead not found"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ResetRequest {
    stage: u32,
}

/// Explicit external stage reset; the only way a stage goes back.
async fn reset_lead(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResetRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .store()
        .reset_stage(&id, Stage(body.stage))
        .await
    {
        Ok(lead) => (StatusCode::OK, Json(serde_json::json!(lead))),
        Err(DatabaseError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Lead not found"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
