//! Outbound event adapters. Each adapter transforms an internal [`Event`]
//! into whatever JSON shape the external service expects, and declares
//! which event types it cares about.
//!
//! Grounded on `core/events/adapters/base.py`'s `EventAdapter` ABC — in
//! particular `should_handle_extended`'s two-stage match (base type, then
//! `message_delta:<subtype>`) is carried over verbatim.

pub mod dingtalk;
pub mod feishu;
pub mod slack;
pub mod webhook;

use serde_json::Value;

use crate::event::Event;

/// Subscription-level config shared by every adapter kind.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub name: String,
    pub endpoint: String,
    pub events: Option<Vec<String>>,
    pub enabled: bool,
    pub headers: Vec<(String, String)>,
    pub timeout_secs: f64,
    pub retry_count: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: String::new(),
            events: None,
            enabled: true,
            headers: Vec::new(),
            timeout_secs: 5.0,
            retry_count: 2,
        }
    }
}

pub trait EventAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// `None` or containing `"*"` matches every event type.
    fn supported_events(&self) -> Option<&[String]>;

    /// Transform the event into the adapter-specific request body. `None`
    /// means the event is dropped (adapter chose not to forward it).
    fn transform(&self, event: &Event) -> Option<Value>;

    fn headers(&self) -> Vec<(String, String)> {
        vec![("content-type".to_string(), "application/json".to_string())]
    }

    fn should_handle(&self, event_type: &str) -> bool {
        match self.supported_events() {
            None => true,
            Some(events) => events.iter().any(|e| e == "*" || e == event_type),
        }
    }

    /// Extended matching: base type first, then the `message_delta:<subtype>`
    /// form for delta events.
    fn should_handle_extended(&self, event: &Event) -> bool {
        if self.should_handle(event.kind.as_str()) {
            return true;
        }
        if let Some(subtype) = event.delta_subtype() {
            let extended = format!("{}:{}", event.kind.as_str(), subtype);
            if let Some(events) = self.supported_events() {
                return events.iter().any(|e| e == &extended);
            }
        }
        false
    }

    /// Optional hook: adapters that synthesize extra delta events out of a
    /// tool result (e.g. rendering a tool call as a chat message) override
    /// this. Default: no extra events.
    fn enhance_tool_result(&self, _event: &Event) -> Vec<Event> {
        Vec::new()
    }
}
