//! Fan-out dispatcher: for every enabled subscription whose adapter wants
//! the event, fires an independent, retrying POST. Grounded on
//! `core/events/dispatcher.py`'s `EventDispatcher.send`/`_send_to_external`
//! (retry count = `retry_count + 1` attempts, `0.5 * (attempt + 1)` second
//! backoff between attempts, 2xx/3xx counted as success).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::adapters::{AdapterConfig, EventAdapter};
use crate::event::Event;

struct Subscription {
    config: AdapterConfig,
    adapter: Arc<dyn EventAdapter>,
}

pub struct EventDispatcher {
    http: reqwest::Client,
    subscriptions: Vec<Subscription>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn add_subscription(&mut self, config: AdapterConfig, adapter: Arc<dyn EventAdapter>) {
        self.subscriptions.push(Subscription { config, adapter });
    }

    /// Fan out the event to every enabled, matching subscription. Each send
    /// runs as its own spawned task — this call never blocks on network I/O.
    pub fn send(&self, event: Event) {
        let event = Arc::new(event);
        for sub in &self.subscriptions {
            if !sub.config.enabled || !sub.adapter.should_handle_extended(event.as_ref()) {
                continue;
            }
            let Some(body) = sub.adapter.transform(event.as_ref()) else {
                continue;
            };
            let http = self.http.clone();
            let endpoint = sub.config.endpoint.clone();
            let headers = {
                let mut h = sub.adapter.headers();
                h.extend(sub.config.headers.clone());
                h
            };
            let name = sub.config.name.clone();
            let attempts = sub.config.retry_count + 1;
            let timeout = Duration::from_secs_f64(sub.config.timeout_secs);

            tokio::spawn(async move {
                send_with_retry(http, &endpoint, &headers, &body, attempts, timeout, &name).await;
            });
        }
    }

    pub fn adapters_summary(&self) -> Vec<(String, bool)> {
        self.subscriptions
            .iter()
            .map(|s| (s.config.name.clone(), s.config.enabled))
            .collect()
    }
}

async fn send_with_retry(
    http: reqwest::Client,
    endpoint: &str,
    headers: &[(String, String)],
    body: &serde_json::Value,
    attempts: u32,
    timeout: Duration,
    name: &str,
) {
    for attempt in 0..attempts {
        let mut req = http.post(endpoint).json(body).timeout(timeout);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                info!(adapter = name, status = %resp.status(), "event delivered");
                return;
            }
            Ok(resp) => {
                warn!(adapter = name, status = %resp.status(), attempt, "event adapter rejected delivery");
            }
            Err(e) => {
                warn!(adapter = name, error = %e, attempt, "event adapter delivery failed");
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(Duration::from_secs_f64(0.5 * (attempt as f64 + 1.0))).await;
        }
    }
    warn!(adapter = name, attempts, "event delivery exhausted retries, dropping");
}
