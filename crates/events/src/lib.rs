//! Typed event bus and outbound adapters (webhook, Slack, DingTalk, Feishu).
//!
//! [`Event`] is the session-facing event envelope, serialized onto SSE/WS
//! and handed to [`dispatcher::EventDispatcher`] for fan-out to configured
//! external subscriptions.

pub mod adapters;
pub mod dispatcher;
pub mod event;

pub use dispatcher::EventDispatcher;
pub use event::{Event, EventKind};
