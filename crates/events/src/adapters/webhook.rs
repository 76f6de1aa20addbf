use serde_json::{json, Value};

use super::EventAdapter;
use crate::event::Event;

/// Generic webhook adapter: forwards the event envelope as-is, optionally
/// through a user-supplied template string with `{field}` substitutions.
pub struct WebhookAdapter {
    name: String,
    template: Option<String>,
    supported_events: Option<Vec<String>>,
}

impl WebhookAdapter {
    pub fn new(name: impl Into<String>, template: Option<String>, supported_events: Option<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            template,
            supported_events,
        }
    }
}

impl EventAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_events(&self) -> Option<&[String]> {
        self.supported_events.as_deref()
    }

    fn transform(&self, event: &Event) -> Option<Value> {
        if let Some(template) = &self.template {
            let mut rendered = template.clone();
            rendered = rendered.replace("{session_id}", &event.session_id);
            rendered = rendered.replace("{type}", event.kind.as_str());
            rendered = rendered.replace("{seq}", &event.seq.to_string());
            return Some(json!({ "rendered": rendered, "raw": event }));
        }
        Some(json!({
            "session_id": event.session_id,
            "type": event.kind.as_str(),
            "seq": event.seq,
            "ts": event.ts,
            "data": event.data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    #[test]
    fn transforms_plain_event() {
        let adapter = WebhookAdapter::new("wh1", None, None);
        let event = Event::new("s1", EventKind::SessionStart, json!({}));
        let payload = adapter.transform(&event).unwrap();
        assert_eq!(payload["session_id"], "s1");
        assert_eq!(payload["type"], "session_start");
    }
}
