//! Session management API endpoints.
//!
//! These endpoints expose the gateway-owned session store (OpenClaw model)
//! alongside the existing SerialMemory session proxy, plus the in-turn
//! control surface (stop / HITL / backtrack / cost-gate / rollback) backed
//! by [`crate::runtime::session_engine::SessionEngine`].

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use sa_domain::config::InboundMetadata;
use sa_sessions::store::SessionOrigin;

use crate::runtime::session_engine::ConfirmationKind;
use crate::state::AppState;

fn not_found(msg: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": msg.into() })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/resolve
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request body for session resolution.
#[derive(Debug, Deserialize)]
pub struct ResolveSessionBody {
    /// Connector name: `"discord"`, `"telegram"`, etc.
    #[serde(default)]
    pub channel: Option<String>,
    /// Bot account ID.
    #[serde(default)]
    pub account_id: Option<String>,
    /// Raw peer ID of the sender.
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Group/server ID (for non-DM messages).
    #[serde(default)]
    pub group_id: Option<String>,
    /// Channel within a group.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Thread or topic ID.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Whether this is a direct/private message.
    #[serde(default)]
    pub is_direct: bool,
}

/// Resolve (or create) a session from inbound metadata.
///
/// This is the main entry point for connectors: send the message metadata,
/// get back a stable session with key, ID, and origin.  Lifecycle resets
/// (daily, idle) are evaluated automatically.
pub async fn resolve_session(
    State(state): State<AppState>,
    Json(body): Json<ResolveSessionBody>,
) -> impl IntoResponse {
    // 1. Resolve peer identity.
    let resolved_peer = body
        .peer_id
        .as_deref()
        .map(|pid| state.identity.resolve(pid));

    // 2. Build inbound metadata with resolved identity.
    let meta = InboundMetadata {
        channel: body.channel.clone(),
        account_id: body.account_id.clone(),
        peer_id: resolved_peer.clone(),
        group_id: body.group_id.clone(),
        channel_id: body.channel_id.clone(),
        thread_id: body.thread_id.clone(),
        is_direct: body.is_direct,
    };

    // 3. Compute session key.
    let session_key = sa_sessions::compute_session_key(
        &state.config.sessions.agent_id,
        state.config.sessions.dm_scope,
        &meta,
    );

    // 4. Resolve or create the session.
    let origin = SessionOrigin {
        channel: body.channel.clone(),
        account: body.account_id.clone(),
        peer: resolved_peer,
        group: body.group_id.clone(),
    };
    let (mut entry, is_new) = state.sessions.resolve_or_create(&session_key, origin);

    // 5. Evaluate lifecycle reset if session is not new.
    if !is_new {
        if let Some(reason) = state.lifecycle.should_reset(&entry, &meta, chrono::Utc::now()) {
            let reason_str = reason.to_string();
            if let Some(reset_entry) = state.sessions.reset_session(&session_key, &reason_str) {
                entry = reset_entry;
            }
        } else {
            state.sessions.touch(&session_key);
        }
    }

    Json(serde_json::json!({
        "session_key": entry.session_key,
        "session_id": entry.session_id,
        "is_new": is_new,
        "created_at": entry.created_at.to_rfc3339(),
        "updated_at": entry.updated_at.to_rfc3339(),
        "origin": entry.origin,
        "sm_session_id": entry.sm_session_id,
        "tokens": {
            "input": entry.input_tokens,
            "output": entry.output_tokens,
            "total": entry.total_tokens,
            "context": entry.context_tokens,
        }
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// List all active sessions.
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.list();
    Json(serde_json::json!({
        "sessions": sessions,
        "count": sessions.len(),
    }))
}

fn session_json(entry: &sa_sessions::SessionEntry) -> serde_json::Value {
    serde_json::json!({
        "session_key": entry.session_key,
        "session_id": entry.session_id,
        "created_at": entry.created_at.to_rfc3339(),
        "updated_at": entry.updated_at.to_rfc3339(),
        "model": entry.model,
        "origin": entry.origin,
        "sm_session_id": entry.sm_session_id,
        "tokens": {
            "input": entry.input_tokens,
            "output": entry.output_tokens,
            "total": entry.total_tokens,
            "context": entry.context_tokens,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetch a single session by its key.
pub async fn get_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&key) {
        Some(entry) => Json(session_json(&entry)).into_response(),
        None => not_found("session not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:key/transcript
// GET /v1/sessions/:key/export
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Return the raw transcript lines for a session (as JSON).
pub async fn get_transcript(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Some(entry) = state.sessions.get(&key) else {
        return not_found("session not found");
    };
    match state.transcripts.read(&entry.session_id) {
        Ok(lines) => Json(serde_json::json!({
            "session_key": entry.session_key,
            "session_id": entry.session_id,
            "lines": lines,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Export the transcript as a plain-text download.
pub async fn export_transcript(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Some(entry) = state.sessions.get(&key) else {
        return not_found("session not found");
    };
    let lines = match state.transcripts.read(&entry.session_id) {
        Ok(lines) => lines,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let mut text = String::new();
    for line in &lines {
        text.push_str(&format!("[{}] {}: {}\n", line.timestamp, line.role, line.content));
    }

    (
        [
            (axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                axum::http::header::CONTENT_DISPOSITION,
                "attachment; filename=\"transcript.txt\"",
            ),
        ],
        text,
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/reset
// POST /v1/sessions/:key/reset
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ResetSessionBody {
    pub session_key: String,
}

/// Manually reset a session (equivalent to `/new` or `/reset` commands).
pub async fn reset_session(
    State(state): State<AppState>,
    Json(body): Json<ResetSessionBody>,
) -> impl IntoResponse {
    match state.sessions.reset_session(&body.session_key, "manual reset") {
        Some(entry) => Json(serde_json::json!({
            "session_key": entry.session_key,
            "session_id": entry.session_id,
            "reset": true,
        }))
        .into_response(),
        None => not_found("session not found"),
    }
}

/// Reset a session addressed by path key (mirrors `reset_session`).
pub async fn reset_session_by_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.sessions.reset_session(&key, "manual reset") {
        Some(entry) => Json(serde_json::json!({
            "session_key": entry.session_key,
            "session_id": entry.session_id,
            "reset": true,
        }))
        .into_response(),
        None => not_found("session not found"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:key/stop
// POST /v1/session/:id/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stop a running turn for a session key (cancels the tool loop and marks
/// the session engine's tracked status, if one is registered under the
/// same key).
pub async fn stop_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.cancel_map.cancel(&key);
    state.session_engine.stop_session(&key);
    Json(serde_json::json!({ "session_key": key, "stopped": cancelled }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/sessions/:key/compact
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Force transcript compaction for a session, regardless of the configured
/// auto-compaction threshold.
pub async fn compact_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let Some(entry) = state.sessions.get(&key) else {
        return not_found("session not found");
    };

    let Some(provider) = crate::runtime::compact::resolve_compaction_provider(&state) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no LLM provider configured for compaction" })),
        )
            .into_response();
    };

    let lines = match state.transcripts.read(&entry.session_id) {
        Ok(lines) => lines,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    match crate::runtime::compact::run_compaction(
        provider.as_ref(),
        &state.transcripts,
        &entry.session_id,
        &lines,
        &state.config.compaction,
    )
    .await
    {
        Ok(summary) if summary.is_empty() => Json(serde_json::json!({
            "compacted": false,
            "reason": "nothing to compact",
        }))
        .into_response(),
        Ok(summary) => Json(serde_json::json!({
            "compacted": true,
            "summary": summary,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session control — /v1/session/:id/*
//
// `:id` is the session_id (not the session_key): guardrails, the
// backtrack controller, the session engine and state-manager rollback
// slots are all keyed by session_id since a single session_key can be
// reset into a fresh session_id mid-conversation.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a pending confirmation of `kind` for `session_id`. Pending
/// confirmations are listed newest-first isn't guaranteed, but there is
/// normally at most one of a given kind outstanding per session at a time.
fn find_pending(
    state: &AppState,
    session_id: &str,
    kind: ConfirmationKind,
) -> Option<uuid::Uuid> {
    state
        .session_engine
        .list_pending(session_id)
        .into_iter()
        .find(|info| info.kind == kind)
        .map(|info| info.id)
}

#[derive(Debug, Deserialize, Default)]
pub struct ContinueBody {
    #[serde(default = "default_true")]
    pub r#continue: bool,
}

fn default_true() -> bool {
    true
}

/// Resolve the long-running-turn confirmation (spec §4.5 phase 6).
pub async fn confirm_continue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ContinueBody>>,
) -> impl IntoResponse {
    let r#continue = body.map(|Json(b)| b.r#continue).unwrap_or(true);
    match find_pending(&state, &id, ConfirmationKind::LongRunning) {
        Some(conf_id) => {
            state.session_engine.submit_long_running(conf_id, r#continue);
            Json(serde_json::json!({ "resolved": true, "continue": r#continue })).into_response()
        }
        None => not_found("no pending long-running confirmation for this session"),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HitlConfirmBody {
    #[serde(default)]
    pub approved: bool,
}

/// Resolve a dangerous-operation HITL confirmation (spec §4.5 phase 4).
pub async fn hitl_confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HitlConfirmBody>,
) -> impl IntoResponse {
    match find_pending(&state, &id, ConfirmationKind::Hitl) {
        Some(conf_id) => {
            state.session_engine.submit_hitl(conf_id, body.approved);
            Json(serde_json::json!({ "resolved": true, "approved": body.approved })).into_response()
        }
        None => not_found("no pending HITL confirmation for this session"),
    }
}

#[derive(Debug, Deserialize)]
pub struct BacktrackConfirmBody {
    /// One of `"retry"`, `"rollback"`, `"stop"`.
    pub choice: String,
}

/// Resolve a backtrack-budget-exhausted confirmation (spec §4.5 phase 5).
pub async fn backtrack_confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BacktrackConfirmBody>,
) -> impl IntoResponse {
    match find_pending(&state, &id, ConfirmationKind::BacktrackExhausted) {
        Some(conf_id) => {
            state
                .session_engine
                .submit_backtrack_exhausted(conf_id, body.choice.clone());
            Json(serde_json::json!({ "resolved": true, "choice": body.choice })).into_response()
        }
        None => not_found("no pending backtrack confirmation for this session"),
    }
}

/// Resolve a cost-gate confirmation (spec §4.5 phase 7).
pub async fn cost_confirm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ContinueBody>>,
) -> impl IntoResponse {
    let r#continue = body.map(|Json(b)| b.r#continue).unwrap_or(false);
    match find_pending(&state, &id, ConfirmationKind::CostGate) {
        Some(conf_id) => {
            state.session_engine.submit_cost_gate(conf_id, r#continue);
            Json(serde_json::json!({ "resolved": true, "continue": r#continue })).into_response()
        }
        None => not_found("no pending cost-gate confirmation for this session"),
    }
}

#[derive(Debug, Deserialize)]
pub struct IntentClarifyBody {
    pub text: String,
}

/// Resolve an ambiguous-intent clarification request (spec §4.5 phase 2).
pub async fn intent_clarify(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IntentClarifyBody>,
) -> impl IntoResponse {
    match find_pending(&state, &id, ConfirmationKind::IntentClarify) {
        Some(conf_id) => {
            state
                .session_engine
                .submit_intent_clarify(conf_id, body.text.clone());
            Json(serde_json::json!({ "resolved": true, "text": body.text })).into_response()
        }
        None => not_found("no pending intent-clarify confirmation for this session"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET  /v1/session/:id/rollback/preview
// POST /v1/session/:id/rollback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Preview which files a rollback would touch, without restoring anything.
pub async fn rollback_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.session_engine.get_state_manager(&id) {
        Some(manager) => Json(serde_json::json!({ "files": manager.preview() })).into_response(),
        None => not_found("no rollback snapshot registered for this session"),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RollbackBody {
    /// Restrict the rollback to these paths. `None` restores everything
    /// in the snapshot's inventory.
    #[serde(default)]
    pub file_paths: Option<Vec<String>>,
}

/// Restore the session's working tree to its pre-turn snapshot (in full,
/// or limited to `file_paths`).
pub async fn rollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RollbackBody>>,
) -> impl IntoResponse {
    let Some(manager) = state.session_engine.get_state_manager(&id) else {
        return not_found("no rollback snapshot registered for this session");
    };
    let file_paths = body.and_then(|Json(b)| b.file_paths);

    match manager.rollback(file_paths.as_deref()) {
        Ok(entries) => Json(serde_json::json!({ "restored": entries })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET    /v1/session/:id
// DELETE /v1/session/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
pub struct GetSessionQuery {
    #[serde(default)]
    pub include_pending: bool,
}

/// Fetch a session by session_id, optionally including its outstanding
/// confirmations.
pub async fn get_session_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<GetSessionQuery>,
) -> impl IntoResponse {
    let Some(entry) = state.sessions.get_by_session_id(&id) else {
        return not_found("session not found");
    };
    let mut body = session_json(&entry);
    if q.include_pending {
        body["pending"] = serde_json::to_value(state.session_engine.list_pending(&id))
            .unwrap_or(serde_json::Value::Null);
    }
    Json(body).into_response()
}

/// Delete a session by session_id: stops the turn if running, tears down
/// the session engine record and any rollback snapshot, and removes the
/// entry from the session store.
pub async fn delete_session_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(entry) = state.sessions.get_by_session_id(&id) else {
        return not_found("session not found");
    };

    state.cancel_map.cancel(&entry.session_key);
    state.session_engine.unregister_state_manager(&id);
    state
        .session_engine
        .end_session(&id, crate::runtime::session_engine::SessionStatus::Stopped);
    state.sessions.delete(&entry.session_key);

    Json(serde_json::json!({ "session_id": id, "deleted": true })).into_response()
}
