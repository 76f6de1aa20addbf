//! Context handed to every background task invocation.
//!
//! Field shape grounded on `utils/background_tasks/context.py`.

use chrono::{DateTime, Utc};

use crate::state::AppState;

#[derive(Clone)]
pub struct TaskContext {
    pub task_name: String,
    pub run_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub state: AppState,
}

impl TaskContext {
    pub fn new(task_name: impl Into<String>, scheduled_at: DateTime<Utc>, state: AppState) -> Self {
        Self {
            task_name: task_name.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            scheduled_at,
            started_at: Utc::now(),
            state,
        }
    }
}
