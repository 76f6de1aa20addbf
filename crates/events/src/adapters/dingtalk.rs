use serde_json::{json, Value};

use super::EventAdapter;
use crate::event::{Event, EventKind};

/// DingTalk custom-robot text message with optional @-mentions.
pub struct DingTalkAdapter {
    name: String,
    at_mobiles: Vec<String>,
    at_all: bool,
}

impl DingTalkAdapter {
    pub fn new(name: impl Into<String>, at_mobiles: Vec<String>, at_all: bool) -> Self {
        Self {
            name: name.into(),
            at_mobiles,
            at_all,
        }
    }

    fn text_for(&self, event: &Event) -> Option<String> {
        match event.kind {
            EventKind::SessionStart | EventKind::SessionEnd | EventKind::Error => {
                Some(format!("[{}] {}", event.kind.as_str(), event.session_id))
            }
            EventKind::HitlConfirm
            | EventKind::LongRunningConfirm
            | EventKind::BacktrackConfirm
            | EventKind::CostLimitConfirm
            | EventKind::CostUrgentConfirm => Some(format!(
                "confirmation needed ({}): session {}",
                event.kind.as_str(),
                event.session_id
            )),
            _ => None,
        }
    }
}

impl EventAdapter for DingTalkAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_events(&self) -> Option<&[String]> {
        None
    }

    fn transform(&self, event: &Event) -> Option<Value> {
        let text = self.text_for(event)?;
        Some(json!({
            "msgtype": "text",
            "text": { "content": text },
            "at": { "atMobiles": self.at_mobiles, "isAtAll": self.at_all },
        }))
    }
}
