//! Loads `scheduled_tasks.yaml` and drives registered tasks on their
//! trigger schedule. `cron` triggers reuse the existing DST-aware
//! evaluator in `runtime/schedules/cron.rs` near-verbatim; `interval` and
//! `once` are new trigger types this framework adds alongside it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;

use sa_domain::error::Result;

use crate::runtime::schedules::cron::cron_next_tz;
use crate::state::AppState;

use super::context::TaskContext;
use super::registry;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum Trigger {
    Cron { expr: String, #[serde(default = "default_tz")] tz: String },
    Interval { seconds: u64 },
    Once { run_at: chrono::DateTime<Utc> },
}

fn default_tz() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledTaskDef {
    pub name: String,
    pub task: String,
    #[serde(flatten)]
    pub trigger: Trigger,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScheduledTasksFile {
    #[serde(default)]
    pub tasks: Vec<ScheduledTaskDef>,
}

pub fn load_config(path: &std::path::Path) -> Result<ScheduledTasksFile> {
    if !path.exists() {
        return Ok(ScheduledTasksFile::default());
    }
    let content = std::fs::read_to_string(path)?;
    let parsed: ScheduledTasksFile = serde_yaml::from_str(&content)
        .map_err(|e| sa_domain::error::Error::Config(e.to_string()))?;
    Ok(parsed)
}

/// Runs scheduled tasks concurrently, bounded by a semaphore so a burst of
/// due tasks can't all run at once. Mirrors `runtime/tasks.rs`'s use of a
/// `Semaphore` for background-task concurrency.
///
/// `state` is set once via [`BackgroundScheduler::set_state`] after
/// `AppState` finishes construction — the scheduler lives inside
/// `AppState` itself, so it cannot borrow an `Arc<AppState>` at
/// construction time without a reference cycle.
pub struct BackgroundScheduler {
    state: std::sync::OnceLock<AppState>,
    concurrency: Arc<Semaphore>,
}

impl BackgroundScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: std::sync::OnceLock::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Must be called once, after the owning `AppState` is fully built.
    pub fn set_state(&self, state: AppState) {
        let _ = self.state.set(state);
    }

    /// Spawn the scheduler loop. Re-evaluates due tasks every `tick`.
    pub fn spawn(self: Arc<Self>, tasks: Vec<ScheduledTaskDef>, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_run: std::collections::HashMap<String, chrono::DateTime<Utc>> =
                std::collections::HashMap::new();
            loop {
                let now = Utc::now();
                for def in tasks.iter().filter(|t| t.enabled) {
                    if self.is_due(def, last_run.get(&def.name), now) {
                        last_run.insert(def.name.clone(), now);
                        self.dispatch(def.clone(), now);
                    }
                }
                tokio::time::sleep(tick).await;
            }
        })
    }

    fn is_due(
        &self,
        def: &ScheduledTaskDef,
        last_run: Option<&chrono::DateTime<Utc>>,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        is_due_impl(def, last_run, now)
    }

    fn dispatch(&self, def: ScheduledTaskDef, now: chrono::DateTime<Utc>) {
        let Some(task_fn) = registry::get(&def.task) else {
            tracing::warn!(task = %def.task, "scheduled task references unregistered task name");
            return;
        };
        let Some(state) = self.state.get().cloned() else {
            tracing::warn!(task = %def.task, "background scheduler fired before state was set");
            return;
        };
        let permits = self.concurrency.clone();
        let task_name = def.task.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire().await.expect("semaphore closed");
            let ctx = TaskContext::new(task_name.clone(), now, state);
            let span = tracing::info_span!("background_task", task_name = %task_name, run_id = %ctx.run_id);
            let _enter = span.enter();
            task_fn(ctx).await;
        });
    }
}

fn is_due_impl(
    def: &ScheduledTaskDef,
    last_run: Option<&chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) -> bool {
    match &def.trigger {
        Trigger::Cron { expr, tz } => {
            let tz = crate::runtime::schedules::cron::parse_tz(tz);
            let after = last_run.copied().unwrap_or(now - chrono::Duration::minutes(1));
            matches!(cron_next_tz(expr, &after, tz), Some(next) if next <= now)
        }
        Trigger::Interval { seconds } => match last_run {
            None => true,
            Some(last) => (now - *last).num_seconds() >= *seconds as i64,
        },
        Trigger::Once { run_at } => last_run.is_none() && *run_at <= now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_trigger_not_due_before_elapsed() {
        let def = ScheduledTaskDef {
            name: "t".into(),
            task: "t".into(),
            trigger: Trigger::Interval { seconds: 60 },
            enabled: true,
        };
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(30);
        assert!(!is_due_impl(&def, Some(&last), now));
    }

    #[test]
    fn interval_trigger_due_after_elapsed() {
        let def = ScheduledTaskDef {
            name: "t".into(),
            task: "t".into(),
            trigger: Trigger::Interval { seconds: 60 },
            enabled: true,
        };
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(90);
        assert!(is_due_impl(&def, Some(&last), now));
    }

    #[test]
    fn interval_trigger_due_on_first_run() {
        let def = ScheduledTaskDef {
            name: "t".into(),
            task: "t".into(),
            trigger: Trigger::Interval { seconds: 60 },
            enabled: true,
        };
        assert!(is_due_impl(&def, None, Utc::now()));
    }

    #[test]
    fn once_trigger_fires_only_first_time() {
        let now = Utc::now();
        let def = ScheduledTaskDef {
            name: "t".into(),
            task: "t".into(),
            trigger: Trigger::Once { run_at: now - chrono::Duration::seconds(1) },
            enabled: true,
        };
        assert!(is_due_impl(&def, None, now));
        assert!(!is_due_impl(&def, Some(&now), now));
    }
}
