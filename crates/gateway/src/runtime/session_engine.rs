//! Session engine — owns per-session lifecycle (create/end/stop), the
//! five human-in-the-loop interrupt kinds the agent execution loop can
//! raise (long-running, dangerous-op/HITL, backtrack-exhausted, cost
//! gate, intent-clarify), and the one state-manager slot a session may
//! register for rollback.
//!
//! Grounded on `core/session/engine.py`'s `SessionEngine` (create/end/
//! stop, `get_stop_event`/`is_stopped`, `register_state_manager`) and
//! `models/hitl.py`'s `ConfirmationRequest` — in particular its
//! `asyncio.Event`-based `set_response`, which is idempotent (a second
//! `set()` is a harmless no-op). `tokio::sync::Notify::notify_waiters`
//! has the same idempotent-broadcast property, so it stands in for the
//! Python `asyncio.Event` here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

use sa_domain::error::{Error, Result};

use super::snapshot::StateManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Confirmation kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationKind {
    LongRunning,
    Hitl,
    BacktrackExhausted,
    CostGate,
    IntentClarify,
}

impl ConfirmationKind {
    /// The documented safe default returned by `wait_*` on timeout
    /// (spec §4.4): HITL rejects, long-running stops, backtrack-exhausted
    /// stops, the cost gate stops spending, and an unanswered
    /// intent-clarify falls back to an empty answer (the loop treats
    /// that as "no clarification given" and surfaces the original error).
    fn safe_default(self) -> &'static str {
        match self {
            ConfirmationKind::LongRunning => "stop",
            ConfirmationKind::Hitl => "reject",
            ConfirmationKind::BacktrackExhausted => "stop",
            ConfirmationKind::CostGate => "stop",
            ConfirmationKind::IntentClarify => "",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationInfo {
    pub id: Uuid,
    pub session_id: String,
    pub kind: ConfirmationKind,
    pub question: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
}

struct PendingConfirmation {
    info: ConfirmationInfo,
    notify: Arc<Notify>,
    response: RwLock<Option<(String, Option<Value>)>>,
    timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    fn is_live(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Running)
    }
}

struct SessionRecord {
    status: SessionStatus,
    stop: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
    state_manager: Option<Arc<StateManager>>,
    created_at: DateTime<Utc>,
}

/// Owns per-session lifecycle, the stop signal, the registered rollback
/// state manager, and every outstanding confirmation request across all
/// five kinds — they differ only in the `ConfirmationKind` tag carried
/// on each request, mirroring the Python original's single unified
/// `ConfirmationRequest` model.
pub struct SessionEngine {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    pending: RwLock<HashMap<Uuid, Arc<PendingConfirmation>>>,
    default_timeout: Duration,
}

impl SessionEngine {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    // ── Session lifecycle (spec §4.4) ─────────────────────────────────

    /// Idempotent on `session_id`, matching the local session store's
    /// `create_session` contract.
    pub fn create_session(&self, session_id: &str) {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                status: SessionStatus::Active,
                stop: Arc::new(Notify::new()),
                stopped: std::sync::atomic::AtomicBool::new(false),
                state_manager: None,
                created_at: Utc::now(),
            });
    }

    pub fn end_session(&self, session_id: &str, status: SessionStatus) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.status = status;
        }
    }

    /// Sets the in-memory stop event AND marks status=stopped AND wakes
    /// any waiter blocked on `get_stop_event`. Closing subscribers is the
    /// local session store's responsibility (it owns the subscriber
    /// list); this only flips the signal the agent loop polls.
    pub fn stop_session(&self, session_id: &str) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.status = SessionStatus::Stopped;
            record.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            record.stop.notify_waiters();
        }
    }

    pub fn is_stopped(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .get(session_id)
            .map(|r| r.stopped.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn get_stop_event(&self, session_id: &str) -> Option<Arc<Notify>> {
        self.sessions.read().get(session_id).map(|r| r.stop.clone())
    }

    pub fn clear_stop_event(&self, session_id: &str) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.stopped.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    // ── State manager registration (rollback, spec §4.5 phase 4) ──────

    pub fn register_state_manager(&self, session_id: &str, manager: Arc<StateManager>) {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                status: SessionStatus::Active,
                stop: Arc::new(Notify::new()),
                stopped: std::sync::atomic::AtomicBool::new(false),
                state_manager: None,
                created_at: Utc::now(),
            })
            .state_manager = Some(manager);
    }

    pub fn get_state_manager(&self, session_id: &str) -> Option<Arc<StateManager>> {
        self.sessions.read().get(session_id).and_then(|r| r.state_manager.clone())
    }

    pub fn unregister_state_manager(&self, session_id: &str) {
        if let Some(record) = self.sessions.write().get_mut(session_id) {
            record.state_manager = None;
        }
    }

    /// Periodic sweep: removes sessions not in `{active, running}` plus
    /// all their handles. Guarded by the same write lock used by every
    /// other mutation, so concurrent sweeps (or a sweep racing a
    /// create/end) can't corrupt the table.
    pub fn sweep_terminated(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, record| record.status.is_live());
        before - sessions.len()
    }

    // ── Generic confirmation registry ─────────────────────────────────

    fn request(
        &self,
        session_id: &str,
        kind: ConfirmationKind,
        question: impl Into<String>,
        options: Vec<String>,
        explicit_timeout: Option<Duration>,
    ) -> (Uuid, ConfirmationInfo) {
        let id = Uuid::new_v4();
        let info = ConfirmationInfo {
            id,
            session_id: session_id.to_string(),
            kind,
            question: question.into(),
            options,
            created_at: Utc::now(),
        };
        let pending = Arc::new(PendingConfirmation {
            info: info.clone(),
            notify: Arc::new(Notify::new()),
            response: RwLock::new(None),
            timeout: explicit_timeout.or(Some(self.default_timeout)),
        });
        self.pending.write().insert(id, pending);
        (id, info)
    }

    /// Wait for a response. On timeout, returns the per-kind safe
    /// default (spec §4.4) instead of an error — only an unknown/already
    /// -resolved id is an error.
    async fn wait(&self, id: Uuid) -> Result<(String, Option<Value>)> {
        let pending = self
            .pending
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ConfirmationNotFound(id.to_string()))?;

        let wait_duration = pending.timeout;
        let notified = pending.notify.notified();

        let outcome = match wait_duration {
            Some(d) if !d.is_zero() => timeout(d, notified).await,
            _ => Ok(notified.await),
        };

        self.pending.write().remove(&id);

        match outcome {
            Ok(()) => Ok(pending
                .response
                .read()
                .clone()
                .unwrap_or_else(|| (pending.info.kind.safe_default().to_string(), None))),
            Err(_) => Ok((pending.info.kind.safe_default().to_string(), None)),
        }
    }

    /// Submit a response. Idempotent: a second submit on an already
    /// resolved or already-removed request is a no-op, matching
    /// `asyncio.Event.set()`'s idempotence in the Python original.
    pub fn submit(&self, id: Uuid, response: String, metadata: Option<Value>) -> bool {
        let pending = match self.pending.read().get(&id).cloned() {
            Some(p) => p,
            None => return false,
        };
        {
            let mut slot = pending.response.write();
            if slot.is_some() {
                return false;
            }
            *slot = Some((response, metadata));
        }
        pending.notify.notify_waiters();
        true
    }

    pub fn info(&self, id: Uuid) -> Option<ConfirmationInfo> {
        self.pending.read().get(&id).map(|p| p.info.clone())
    }

    pub fn list_pending(&self, session_id: &str) -> Vec<ConfirmationInfo> {
        self.pending
            .read()
            .values()
            .map(|p| p.info.clone())
            .filter(|info| info.session_id == session_id)
            .collect()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // ── Typed wait_<kind>/submit_<kind> pairs (spec §4.4) ─────────────

    pub fn request_long_running(&self, session_id: &str, loop_count: usize) -> (Uuid, ConfirmationInfo) {
        self.request(
            session_id,
            ConfirmationKind::LongRunning,
            format!("turn has run {loop_count} tool-call loops — continue?"),
            vec!["continue".into(), "stop".into()],
            None,
        )
    }

    pub async fn wait_long_running(&self, id: Uuid) -> Result<bool> {
        let (answer, _) = self.wait(id).await?;
        Ok(answer == "continue")
    }

    pub fn submit_long_running(&self, id: Uuid, r#continue: bool) -> bool {
        self.submit(id, if r#continue { "continue" } else { "stop" }.into(), None)
    }

    pub fn request_hitl(&self, session_id: &str, question: impl Into<String>) -> (Uuid, ConfirmationInfo) {
        self.request(
            session_id,
            ConfirmationKind::Hitl,
            question,
            vec!["approve".into(), "reject".into()],
            None,
        )
    }

    pub async fn wait_hitl(&self, id: Uuid) -> Result<bool> {
        let (answer, _) = self.wait(id).await?;
        Ok(answer == "approve")
    }

    pub fn submit_hitl(&self, id: Uuid, approved: bool) -> bool {
        self.submit(id, if approved { "approve" } else { "reject" }.into(), None)
    }

    pub fn request_backtrack_exhausted(&self, session_id: &str) -> (Uuid, ConfirmationInfo) {
        self.request(
            session_id,
            ConfirmationKind::BacktrackExhausted,
            "backtrack budget exhausted — retry, rollback, or stop?",
            vec!["retry".into(), "rollback".into(), "stop".into()],
            None,
        )
    }

    pub async fn wait_backtrack_exhausted(&self, id: Uuid) -> Result<String> {
        let (answer, _) = self.wait(id).await?;
        Ok(answer)
    }

    pub fn submit_backtrack_exhausted(&self, id: Uuid, choice: String) -> bool {
        self.submit(id, choice, None)
    }

    pub fn request_cost_gate(&self, session_id: &str, urgent: bool, spent_usd: f64) -> (Uuid, ConfirmationInfo) {
        self.request(
            session_id,
            ConfirmationKind::CostGate,
            format!(
                "{} cost threshold reached (${spent_usd:.2} spent) — continue?",
                if urgent { "urgent" } else { "soft" }
            ),
            vec!["continue".into(), "stop".into()],
            None,
        )
    }

    pub async fn wait_cost_gate(&self, id: Uuid) -> Result<bool> {
        let (answer, _) = self.wait(id).await?;
        Ok(answer == "continue")
    }

    pub fn submit_cost_gate(&self, id: Uuid, r#continue: bool) -> bool {
        self.submit(id, if r#continue { "continue" } else { "stop" }.into(), None)
    }

    pub fn request_intent_clarify(&self, session_id: &str, question: impl Into<String>) -> (Uuid, ConfirmationInfo) {
        self.request(session_id, ConfirmationKind::IntentClarify, question, vec![], None)
    }

    pub async fn wait_intent_clarify(&self, id: Uuid) -> Result<String> {
        let (answer, _) = self.wait(id).await?;
        Ok(answer)
    }

    pub fn submit_intent_clarify(&self, id: Uuid, text: String) -> bool {
        self.submit(id, text, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_wakes_waiter() {
        let engine = Arc::new(SessionEngine::new(Duration::from_secs(30)));
        let (id, _info) = engine.request_hitl("s1", "proceed?");

        let engine2 = engine.clone();
        let handle = tokio::spawn(async move { engine2.wait_hitl(id).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.submit_hitl(id, true));

        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn second_submit_is_noop() {
        let engine = SessionEngine::new(Duration::from_secs(30));
        let (id, _) = engine.request_cost_gate("s1", false, 1.23);
        assert!(engine.submit_cost_gate(id, true));
        assert!(!engine.submit_cost_gate(id, false));
    }

    #[tokio::test]
    async fn wait_times_out_to_safe_default() {
        let engine = SessionEngine::new(Duration::from_millis(20));
        let (id, _) = engine.request_long_running("s1", 3);
        // long_running's safe default is "stop" => wait_long_running() is false.
        let result = engine.wait_long_running(id).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn hitl_timeout_rejects() {
        let engine = SessionEngine::new(Duration::from_millis(20));
        let (id, _) = engine.request_hitl("s1", "dangerous op?");
        let approved = engine.wait_hitl(id).await.unwrap();
        assert!(!approved);
    }

    #[test]
    fn stop_session_sets_flag() {
        let engine = SessionEngine::new(Duration::from_secs(30));
        engine.create_session("s1");
        assert!(!engine.is_stopped("s1"));
        engine.stop_session("s1");
        assert!(engine.is_stopped("s1"));
    }

    #[test]
    fn sweep_removes_terminated_sessions() {
        let engine = SessionEngine::new(Duration::from_secs(30));
        engine.create_session("s1");
        engine.create_session("s2");
        engine.end_session("s1", SessionStatus::Completed);
        let removed = engine.sweep_terminated();
        assert_eq!(removed, 1);
        assert!(engine.get_stop_event("s1").is_none());
        assert!(engine.get_stop_event("s2").is_some());
    }

    #[test]
    fn state_manager_register_get_unregister() {
        let engine = SessionEngine::new(Duration::from_secs(30));
        let manager = Arc::new(StateManager::new(super::super::snapshot::StateSnapshot::new(
            "s1".into(),
            std::path::PathBuf::from("/tmp"),
        )));
        engine.register_state_manager("s1", manager);
        assert!(engine.get_state_manager("s1").is_some());
        engine.unregister_state_manager("s1");
        assert!(engine.get_state_manager("s1").is_none());
    }
}
