use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event type a session can emit over SSE/WS and fan out to
/// external adapters, per the session/event pipeline's wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    ConversationStart,
    MessageStart,
    ContentStart,
    ContentDelta,
    ContentStop,
    MessageDelta,
    MessageStop,
    SessionEnd,
    Tick,
    Error,
    LongRunningConfirm,
    HitlConfirm,
    BacktrackConfirm,
    CostLimitConfirm,
    CostUrgentConfirm,
    IntentClarifyRequest,
    PlaybookSuggestion,
    RecommendedQuestions,
    ConversationDelta,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::ConversationStart => "conversation_start",
            EventKind::MessageStart => "message_start",
            EventKind::ContentStart => "content_start",
            EventKind::ContentDelta => "content_delta",
            EventKind::ContentStop => "content_stop",
            EventKind::MessageDelta => "message_delta",
            EventKind::MessageStop => "message_stop",
            EventKind::SessionEnd => "session_end",
            EventKind::Tick => "tick",
            EventKind::Error => "error",
            EventKind::LongRunningConfirm => "long_running_confirm",
            EventKind::HitlConfirm => "hitl_confirm",
            EventKind::BacktrackConfirm => "backtrack_confirm",
            EventKind::CostLimitConfirm => "cost_limit_confirm",
            EventKind::CostUrgentConfirm => "cost_urgent_confirm",
            EventKind::IntentClarifyRequest => "intent_clarify_request",
            EventKind::PlaybookSuggestion => "playbook_suggestion",
            EventKind::RecommendedQuestions => "recommended_questions",
            EventKind::ConversationDelta => "conversation_delta",
        }
    }
}

/// Envelope carried on the session's event history and fanned out to
/// subscribers. `seq` is assigned by the local session store at buffer
/// time, not by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(session_id: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            seq: 0,
            session_id: session_id.into(),
            kind,
            data,
            ts: Utc::now(),
        }
    }

    /// For `message_delta` events, the nested delta subtype at `data.delta.type`,
    /// used by adapters' extended matching (`kind:subtype`).
    pub fn delta_subtype(&self) -> Option<&str> {
        if self.kind != EventKind::MessageDelta {
            return None;
        }
        self.data.get("delta")?.get("type")?.as_str()
    }
}
