//! Generic human-confirmation registry endpoints.
//!
//! Thin wrapper over [`crate::runtime::session_engine::SessionEngine`]'s
//! untyped `submit`/`info`/`list_pending` — a client that only knows the
//! confirmation ID (e.g. from a push notification) can resolve it here
//! without needing to know which session-control shortcut route (HITL,
//! backtrack, cost-gate, ...) the kind maps to.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/human-confirmation/pending
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub session_id: String,
}

/// List confirmations still awaiting a response for a given session.
pub async fn list_pending(
    State(state): State<AppState>,
    Query(q): Query<PendingQuery>,
) -> impl IntoResponse {
    let pending = state.session_engine.list_pending(&q.session_id);
    Json(serde_json::json!({
        "pending": pending,
        "count": pending.len(),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/human-confirmation/stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregate counts of outstanding confirmations, grouped by kind.
///
/// `SessionEngine` only exposes per-session `list_pending`, so this
/// aggregates across the sessions the gateway currently tracks.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut by_kind: std::collections::HashMap<&'static str, usize> = std::collections::HashMap::new();
    let mut total = 0usize;

    for entry in state.sessions.list() {
        for info in state.session_engine.list_pending(&entry.session_id) {
            total += 1;
            let kind = match info.kind {
                crate::runtime::session_engine::ConfirmationKind::LongRunning => "long_running",
                crate::runtime::session_engine::ConfirmationKind::Hitl => "hitl",
                crate::runtime::session_engine::ConfirmationKind::BacktrackExhausted => {
                    "backtrack_exhausted"
                }
                crate::runtime::session_engine::ConfirmationKind::CostGate => "cost_gate",
                crate::runtime::session_engine::ConfirmationKind::IntentClarify => "intent_clarify",
            };
            *by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    Json(serde_json::json!({
        "total_pending": total,
        "by_kind": by_kind,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET  /v1/human-confirmation/:id
// POST /v1/human-confirmation/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetch a single confirmation's question/options/kind by ID.
pub async fn get_confirmation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.session_engine.info(id) {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "confirmation not found" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub response: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Submit a free-form response to a pending confirmation. Idempotent: a
/// second submit on an already-resolved ID is a no-op (returns `false`).
pub async fn submit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmitBody>,
) -> impl IntoResponse {
    let ok = state.session_engine.submit(id, body.response, body.metadata);
    if ok {
        Json(serde_json::json!({ "id": id, "resolved": true })).into_response()
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "id": id, "resolved": false, "error": "already resolved or unknown" })),
        )
            .into_response()
    }
}
