use serde_json::{json, Value};

use super::EventAdapter;
use crate::event::{Event, EventKind};

/// Posts a formatted Slack message (`chat.postMessage`-compatible body) for
/// session lifecycle and content events.
pub struct SlackAdapter {
    name: String,
    channel: String,
}

impl SlackAdapter {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
        }
    }

    fn text_for(&self, event: &Event) -> Option<String> {
        match event.kind {
            EventKind::SessionStart => Some(format!(":rocket: session `{}` started", event.session_id)),
            EventKind::SessionEnd => Some(format!(":checkered_flag: session `{}` ended", event.session_id)),
            EventKind::Error => Some(format!(
                ":warning: error in session `{}`: {}",
                event.session_id,
                event.data.get("message").and_then(Value::as_str).unwrap_or("unknown error")
            )),
            EventKind::HitlConfirm | EventKind::LongRunningConfirm | EventKind::CostLimitConfirm => Some(format!(
                ":raised_hand: confirmation needed in session `{}`: {}",
                event.session_id,
                event.data.get("question").and_then(Value::as_str).unwrap_or("")
            )),
            _ => None,
        }
    }
}

impl EventAdapter for SlackAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_events(&self) -> Option<&[String]> {
        None
    }

    fn transform(&self, event: &Event) -> Option<Value> {
        let text = self.text_for(event)?;
        Some(json!({ "channel": self.channel, "text": text }))
    }
}
