//! Named async task registry.
//!
//! Python's original (`utils/background_tasks/registry.py`) registers
//! tasks via a `@background_task(name)` runtime decorator into a module
//! global. Rust has no equivalent implicit-registration mechanism without
//! reaching for a proc-macro crate the teacher's stack doesn't carry
//! (`inventory`), so registration here is an explicit call inside
//! `register_all()` — following this codebase's existing bootstrap-style
//! construction in `runtime/tasks.rs`. Duplicate names log a warning and
//! the later registration wins, matching the Python original exactly.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::context::TaskContext;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

static REGISTRY: Lazy<Mutex<HashMap<String, TaskFn>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register(name: impl Into<String>, f: TaskFn) {
    let name = name.into();
    let mut registry = REGISTRY.lock();
    if registry.contains_key(&name) {
        tracing::warn!(task = %name, "background task registered twice, later registration wins");
    }
    registry.insert(name, f);
}

pub fn get(name: &str) -> Option<TaskFn> {
    REGISTRY.lock().get(name).cloned()
}

pub fn registered_names() -> Vec<String> {
    REGISTRY.lock().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        register("test-task-registry-smoke", Arc::new(|_ctx| Box::pin(async {})));
        assert!(get("test-task-registry-smoke").is_some());
        assert!(registered_names().contains(&"test-task-registry-smoke".to_string()));
    }

    #[test]
    fn duplicate_registration_keeps_latest() {
        register("test-task-registry-dup", Arc::new(|_ctx| Box::pin(async {})));
        register("test-task-registry-dup", Arc::new(|_ctx| Box::pin(async {})));
        assert!(get("test-task-registry-dup").is_some());
    }
}
