//! Conversation CRUD — backed by the `instance.db`/`memory_fts.db` tables
//! owned by [`sa_storage::StorageManager`].
//!
//! Writes go through the write-behind queue (`StorageManager::write`);
//! reads query the underlying SQLite connections directly (wrapped in
//! `spawn_blocking`, per `Databases`'s own doc comment) since there is no
//! async layer needed for a single indexed `SELECT`.
//!
//! The `agent_id` column doubles as the conversation's owning user scope
//! here — this gateway doesn't track a separate per-user identity beyond
//! the configured `sessions.agent_id` / resolved peer identity, so
//! `user_id` query params are matched against that column.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use rusqlite::OptionalExtension;
use serde::Deserialize;

use sa_storage::WriteOp;

use crate::state::AppState;

fn db_error(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn not_found(msg: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": msg.into() })),
    )
        .into_response()
}

#[derive(Debug, Clone, serde::Serialize)]
struct ConversationRow {
    id: String,
    session_id: String,
    agent_id: String,
    title: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

fn query_conversation(
    dbs: &sa_storage::Databases,
    id: &str,
) -> rusqlite::Result<Option<ConversationRow>> {
    dbs.instance
        .lock()
        .query_row(
            "SELECT id, session_id, agent_id, title, status, created_at, updated_at \
             FROM conversations WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    title: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/conversations?user_id&title
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateConversationQuery {
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Query(q): Query<CreateConversationQuery>,
) -> impl IntoResponse {
    let id = uuid::Uuid::new_v4().to_string();
    let session_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let op = WriteOp::UpsertConversation {
        id: id.clone(),
        session_id: session_id.clone(),
        agent_id: q.user_id.clone(),
        title: q.title.clone(),
        status: "active".into(),
        created_at: now.clone(),
        updated_at: now.clone(),
    };
    if let Err(e) = state.storage.write(op).await {
        return db_error(e);
    }

    Json(serde_json::json!({
        "id": id,
        "session_id": session_id,
        "user_id": q.user_id,
        "title": q.title,
        "status": "active",
        "created_at": now,
        "updated_at": now,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations?user_id&limit&offset
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListConversationsQuery>,
) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<ConversationRow>> {
        let conn = dbs.instance.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, agent_id, title, status, created_at, updated_at \
             FROM conversations WHERE agent_id = ?1 \
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![q.user_id, q.limit, q.offset], |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    title: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await;

    match result {
        Ok(Ok(rows)) => Json(serde_json::json!({ "conversations": rows, "count": rows.len() })).into_response(),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/search?user_id&q&limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SearchConversationsQuery {
    pub user_id: String,
    pub q: String,
    #[serde(default = "default_search_limit")]
    pub limit: i64,
}

fn default_search_limit() -> i64 {
    20
}

/// FTS over title (`conversations.title`) + body (`message_fts.body`),
/// ranked in result order: title matches first, then content matches.
pub async fn search(
    State(state): State<AppState>,
    Query(q): Query<SearchConversationsQuery>,
) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let user_id = q.user_id.clone();
    let query = q.q.clone();
    let limit = q.limit;

    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<serde_json::Value>> {
        let mut hits = Vec::new();

        // Title matches.
        {
            let conn = dbs.instance.lock();
            let mut stmt = conn.prepare(
                "SELECT id, title FROM conversations \
                 WHERE agent_id = ?1 AND title LIKE ?2 LIMIT ?3",
            )?;
            let pattern = format!("%{query}%");
            let rows = stmt
                .query_map(rusqlite::params![user_id, pattern, limit], |row| {
                    let id: String = row.get(0)?;
                    let title: Option<String> = row.get(1)?;
                    Ok((id, title))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (id, title) in rows {
                hits.push(serde_json::json!({
                    "conversation_id": id,
                    "match_type": "title",
                    "snippet": title.unwrap_or_default(),
                }));
            }
        }

        // Content (FTS) matches, joined back to the owning conversation.
        if (hits.len() as i64) < limit {
            let remaining = limit - hits.len() as i64;
            let ids: Vec<String> = {
                let conn = dbs.instance.lock();
                let mut stmt = conn.prepare("SELECT id FROM conversations WHERE agent_id = ?1")?;
                stmt.query_map(rusqlite::params![user_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let fts = dbs.memory_fts.lock();
            let mut stmt = fts.prepare(
                "SELECT conversation_id, snippet(message_fts, 2, '[', ']', '...', 12) \
                 FROM message_fts WHERE message_fts MATCH ?1 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![query, remaining], |row| {
                    let cid: String = row.get(0)?;
                    let snippet: String = row.get(1)?;
                    Ok((cid, snippet))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (cid, snippet) in rows {
                if ids.contains(&cid) {
                    hits.push(serde_json::json!({
                        "conversation_id": cid,
                        "match_type": "content",
                        "snippet": snippet,
                    }));
                }
            }
        }

        Ok(hits)
    })
    .await;

    match result {
        Ok(Ok(hits)) => Json(serde_json::json!({ "results": hits })).into_response(),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let lookup_id = id.clone();
    let result =
        tokio::task::spawn_blocking(move || query_conversation(&dbs, &lookup_id)).await;

    match result {
        Ok(Ok(Some(row))) => Json(row).into_response(),
        Ok(Ok(None)) => not_found("conversation not found"),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PUT /v1/conversations/:id?title
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct RenameQuery {
    pub title: String,
}

pub async fn rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RenameQuery>,
) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let lookup_id = id.clone();
    let existing = match tokio::task::spawn_blocking(move || query_conversation(&dbs, &lookup_id)).await {
        Ok(Ok(Some(row))) => row,
        Ok(Ok(None)) => return not_found("conversation not found"),
        Ok(Err(e)) => return db_error(e),
        Err(e) => return db_error(e),
    };

    let now = chrono::Utc::now().to_rfc3339();
    let op = WriteOp::UpsertConversation {
        id: existing.id.clone(),
        session_id: existing.session_id.clone(),
        agent_id: existing.agent_id.clone(),
        title: Some(q.title.clone()),
        status: existing.status.clone(),
        created_at: existing.created_at.clone(),
        updated_at: now,
    };
    if let Err(e) = state.storage.write(op).await {
        return db_error(e);
    }

    Json(serde_json::json!({ "id": id, "title": q.title, "renamed": true })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /v1/conversations/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let lookup_id = id.clone();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<bool> {
        let conn = dbs.instance.lock();
        conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            rusqlite::params![lookup_id],
        )?;
        let deleted = conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            rusqlite::params![lookup_id],
        )?;
        Ok(deleted > 0)
    })
    .await;

    match result {
        Ok(Ok(true)) => Json(serde_json::json!({ "id": id, "deleted": true })).into_response(),
        Ok(Ok(false)) => not_found("conversation not found"),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/:id/messages?limit&offset&order
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_order")]
    pub order: String,
}

fn default_order() -> String {
    "asc".into()
}

pub async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let descending = q.order.eq_ignore_ascii_case("desc");
    let order_sql = if descending { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT id, role, content_json, status, seq, created_at FROM messages \
         WHERE conversation_id = ?1 ORDER BY seq {order_sql} LIMIT ?2 OFFSET ?3"
    );

    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<serde_json::Value>> {
        let conn = dbs.instance.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![id, q.limit, q.offset], |row| {
                let content_json: String = row.get(2)?;
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "role": row.get::<_, String>(1)?,
                    "content": serde_json::from_str::<serde_json::Value>(&content_json)
                        .unwrap_or(serde_json::Value::Null),
                    "status": row.get::<_, String>(3)?,
                    "seq": row.get::<_, i64>(4)?,
                    "created_at": row.get::<_, String>(5)?,
                }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await;

    match result {
        Ok(Ok(rows)) => Json(serde_json::json!({ "messages": rows, "count": rows.len() })).into_response(),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/conversations/:id/summary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lightweight summary: message counts + the most recent message's
/// preview. Does not invoke an LLM — `compact_session` is the place for
/// model-generated summaries of a running session's transcript.
pub async fn summary(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let dbs = state.storage.dbs.clone();
    let lookup_id = id.clone();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Option<serde_json::Value>> {
        let conn = dbs.instance.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM messages WHERE conversation_id = ?1",
            rusqlite::params![lookup_id],
            |row| row.get(0),
        )?;
        let last: Option<(String, String)> = conn
            .query_row(
                "SELECT role, content_json FROM messages WHERE conversation_id = ?1 \
                 ORDER BY seq DESC LIMIT 1",
                rusqlite::params![lookup_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(Some(serde_json::json!({
            "conversation_id": lookup_id,
            "message_count": count,
            "last_message": last.map(|(role, content_json)| serde_json::json!({
                "role": role,
                "content": serde_json::from_str::<serde_json::Value>(&content_json)
                    .unwrap_or(serde_json::Value::Null),
            })),
        })))
    })
    .await;

    match result {
        Ok(Ok(Some(v))) => Json(v).into_response(),
        Ok(Ok(None)) => not_found("conversation not found"),
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/conversations/:id/preload?limit&force
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize, Default)]
pub struct PreloadQuery {
    #[serde(default = "default_preload_limit")]
    pub limit: i64,
    #[serde(default)]
    pub force: bool,
}

fn default_preload_limit() -> i64 {
    20
}

/// Warm the recent-message cache for a conversation ahead of the next
/// turn, so `prepare_turn_context` doesn't pay a cold SQLite read on the
/// hot path. `force` re-reads even if the cache already holds the entry.
pub async fn preload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<PreloadQuery>,
) -> impl IntoResponse {
    if !q.force {
        if let Some(cached) = state.user_facts_cache.read().get(&id) {
            if cached.fetched_at.elapsed() < std::time::Duration::from_secs(60) {
                return Json(serde_json::json!({ "id": id, "preloaded": false, "cached": true }))
                    .into_response();
            }
        }
    }

    let dbs = state.storage.dbs.clone();
    let lookup_id = id.clone();
    let limit = q.limit;
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<usize> {
        let conn = dbs.instance.lock();
        let mut stmt = conn.prepare(
            "SELECT content_json FROM messages WHERE conversation_id = ?1 \
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![lookup_id, limit], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.len())
    })
    .await;

    match result {
        Ok(Ok(n)) => {
            state.user_facts_cache.write().insert(
                id.clone(),
                crate::state::CachedUserFacts {
                    content: format!("{n} messages preloaded"),
                    fetched_at: std::time::Instant::now(),
                },
            );
            Json(serde_json::json!({ "id": id, "preloaded": true, "messages": n })).into_response()
        }
        Ok(Err(e)) => db_error(e),
        Err(e) => db_error(e),
    }
}
