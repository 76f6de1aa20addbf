//! In-memory session store: live session metadata, per-user session index,
//! per-session event history (for SSE/WS replay-by-seq), and per-session
//! subscriber fan-out.
//!
//! A near 1:1 translation of `infra/local_store/session_store.py`'s
//! `LocalSessionStore`, restructured onto the bounded ring-buffer idiom
//! already used by this codebase's run history (`runtime/runs.rs`): a
//! `VecDeque` capped at `MAX_EVENTS_PER_SESSION`, so a long-lived session
//! can't grow its in-memory history without bound while still supporting
//! O(1) replay lookups by sequence number for any event still in the
//! window.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use sa_events::Event;

const MAX_EVENTS_PER_SESSION: usize = 5000;
const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct SessionEvents {
    /// Logical sequence number of `events[0]`; events before this have been
    /// evicted. `seq` assigned to new events is always `base_seq + events.len() + 1`.
    base_seq: u64,
    events: VecDeque<Event>,
}

impl SessionEvents {
    fn new() -> Self {
        Self {
            base_seq: 0,
            events: VecDeque::new(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.base_seq + self.events.len() as u64 + 1
    }

    fn push(&mut self, event: Event) {
        self.events.push_back(event);
        if self.events.len() > MAX_EVENTS_PER_SESSION {
            self.events.pop_front();
            self.base_seq += 1;
        }
    }

    fn after(&self, after_seq: u64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect()
    }
}

struct SessionState {
    metadata: SessionMetadata,
    context: serde_json::Value,
    events: SessionEvents,
    subscribers: Vec<mpsc::Sender<Option<Event>>>,
}

/// Pure in-memory, process-local session store. Not persisted — durable
/// conversation/message history lives in `sa-storage`; this store exists
/// purely to drive live SSE/WS fan-out with replay-by-seq.
pub struct LocalSessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    user_sessions: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for LocalSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            user_sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_session(&self, session_id: &str, user_id: &str, agent_id: &str) {
        let now = Utc::now();
        let state = SessionState {
            metadata: SessionMetadata {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                agent_id: agent_id.to_string(),
                status: SessionStatus::Active,
                created_at: now,
                updated_at: now,
            },
            context: serde_json::json!({}),
            events: SessionEvents::new(),
            subscribers: Vec::new(),
        };
        self.sessions.write().insert(session_id.to_string(), state);
        self.user_sessions
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn complete_session(&self, session_id: &str, status: SessionStatus) {
        let mut sessions = self.sessions.write();
        let Some(state) = sessions.get_mut(session_id) else {
            return;
        };
        state.metadata.status = status;
        state.metadata.updated_at = Utc::now();
        // Wake every subscriber with the sentinel so their `subscribe_events`
        // loop terminates instead of waiting out the full timeout.
        for sub in &state.subscribers {
            let _ = sub.try_send(None);
        }
    }

    /// Buffer an event into session history and push it to every live
    /// subscriber. A subscriber whose queue is full is skipped, not
    /// dropped from the subscriber list — it will simply miss this event
    /// and can recover via replay-by-seq on reconnect.
    pub fn buffer_event(&self, session_id: &str, mut event: Event) -> Option<u64> {
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(session_id)?;
        let seq = state.events.next_seq();
        event.seq = seq;
        event.session_id = session_id.to_string();
        state.events.push(event.clone());
        state.metadata.updated_at = Utc::now();

        state.subscribers.retain(|sub| {
            match sub.try_send(Some(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session_id, "subscriber queue full, dropping event for it");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Some(seq)
    }

    pub fn get_events(&self, session_id: &str, after_seq: u64, limit: Option<usize>) -> Vec<Event> {
        let sessions = self.sessions.read();
        let Some(state) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut events = state.events.after(after_seq);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }

    /// Register a new subscriber queue, immediately backfilling it with
    /// events newer than `after_seq` so a reconnecting client never misses
    /// history still in the window. Returns the receiver to poll.
    pub fn subscribe(&self, session_id: &str, after_seq: u64) -> Option<mpsc::Receiver<Option<Event>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut sessions = self.sessions.write();
        let state = sessions.get_mut(session_id)?;

        for event in state.events.after(after_seq) {
            // Backfill is best-effort: a slow consumer may see a full queue
            // even before it starts — it will recover via replay on its
            // next reconnect instead of blocking registration here.
            let _ = tx.try_send(Some(event));
        }
        state.subscribers.push(tx);
        Some(rx)
    }

    /// Must be called when a subscriber's consumer loop exits, on both the
    /// normal-completion and cancelled paths — otherwise its channel
    /// lingers in the subscriber list until the next `buffer_event` call
    /// notices it's closed.
    pub fn unsubscribe(&self, session_id: &str, closed_sender: &mpsc::Sender<Option<Event>>) {
        let mut sessions = self.sessions.write();
        if let Some(state) = sessions.get_mut(session_id) {
            state
                .subscribers
                .retain(|sub| !sub.same_channel(closed_sender));
        }
    }

    pub fn metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        self.sessions.read().get(session_id).map(|s| s.metadata.clone())
    }

    pub fn user_sessions(&self, user_id: &str) -> Vec<String> {
        self.user_sessions
            .read()
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_active(&self) -> Vec<SessionMetadata> {
        self.sessions
            .read()
            .values()
            .filter(|s| matches!(s.metadata.status, SessionStatus::Active | SessionStatus::Running))
            .map(|s| s.metadata.clone())
            .collect()
    }

    /// Drop every session not in {Active, Running} and fully purge its
    /// per-session state (events, subscribers, context, user index entry).
    pub fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !matches!(s.metadata.status, SessionStatus::Active | SessionStatus::Running))
            .map(|(id, _)| id.clone())
            .collect();

        let mut user_sessions = self.user_sessions.write();
        for id in &stale {
            if let Some(state) = sessions.remove(id) {
                if let Some(set) = user_sessions.get_mut(&state.metadata.user_id) {
                    set.remove(id);
                }
            }
        }
        stale.len()
    }
}

pub type SharedLocalSessionStore = Arc<LocalSessionStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use sa_events::EventKind;
    use serde_json::json;

    #[test]
    fn buffer_assigns_increasing_seq() {
        let store = LocalSessionStore::new();
        store.create_session("s1", "u1", "a1");
        let seq1 = store
            .buffer_event("s1", Event::new("s1", EventKind::SessionStart, json!({})))
            .unwrap();
        let seq2 = store
            .buffer_event("s1", Event::new("s1", EventKind::Tick, json!({})))
            .unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
    }

    #[test]
    fn replay_after_seq() {
        let store = LocalSessionStore::new();
        store.create_session("s1", "u1", "a1");
        for _ in 0..5 {
            store.buffer_event("s1", Event::new("s1", EventKind::Tick, json!({})));
        }
        let replay = store.get_events("s1", 2, None);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].seq, 3);
    }

    #[tokio::test]
    async fn subscriber_receives_backfill_then_live_events() {
        let store = Arc::new(LocalSessionStore::new());
        store.create_session("s1", "u1", "a1");
        store.buffer_event("s1", Event::new("s1", EventKind::SessionStart, json!({})));

        let mut rx = store.subscribe("s1", 0).unwrap();
        let backfilled = rx.recv().await.unwrap().unwrap();
        assert_eq!(backfilled.seq, 1);

        store.buffer_event("s1", Event::new("s1", EventKind::Tick, json!({})));
        let live = rx.recv().await.unwrap().unwrap();
        assert_eq!(live.seq, 2);
    }

    #[test]
    fn cleanup_removes_completed_sessions() {
        let store = LocalSessionStore::new();
        store.create_session("s1", "u1", "a1");
        store.complete_session("s1", SessionStatus::Completed);
        let removed = store.cleanup();
        assert_eq!(removed, 1);
        assert!(store.metadata("s1").is_none());
    }
}
