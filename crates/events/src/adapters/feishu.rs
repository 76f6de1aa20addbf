use serde_json::{json, Value};

use super::EventAdapter;
use crate::event::{Event, EventKind};

/// Feishu/Lark custom-bot text message with optional @-mentions by user id.
pub struct FeishuAdapter {
    name: String,
    at_users: Vec<String>,
}

impl FeishuAdapter {
    pub fn new(name: impl Into<String>, at_users: Vec<String>) -> Self {
        Self {
            name: name.into(),
            at_users,
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

impl EventAdapter for FeishuAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_events(&self) -> Option<&[String]> {
        None
    }

    fn transform(&self, event: &Event) -> Option<Value> {
        let text = self.text_for(event)?;
        let mentions = self
            .at_users
            .iter()
            .map(|u| format!("<at user_id=\"{u}\"></at>"))
            .collect::<Vec<_>>()
            .join(" ");
        let text = if mentions.is_empty() {
            text
        } else {
            format!("{mentions} {text}")
        };
        Some(json!({ "msg_type": "text", "content": { "text": text } }))
    }
}
