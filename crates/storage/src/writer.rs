//! Write-behind queue: callers enqueue a [`WriteOp`] and return immediately;
//! a fixed pool of workers drains the queue and applies operations against
//! SQLite off the async runtime's worker threads.
//!
//! Defaults (`max_queue_size = 10_000`, `worker_count = 5`, `max_retries =
//! 3`) match the Python original's `AsyncWriter` global instance.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, warn};

use sa_domain::error::Result;

use crate::db::Databases;

/// A single persistence operation. `apply` runs inside `spawn_blocking`.
#[derive(Clone)]
pub enum WriteOp {
    InsertMessage {
        id: String,
        conversation_id: String,
        role: String,
        content_json: String,
        status: String,
        seq: i64,
        created_at: String,
    },
    UpsertConversation {
        id: String,
        session_id: String,
        agent_id: String,
        title: Option<String>,
        status: String,
        created_at: String,
        updated_at: String,
    },
    IndexMessageFts {
        message_id: String,
        conversation_id: String,
        body: String,
    },
}

impl WriteOp {
    fn apply(&self, dbs: &Databases) -> Result<()> {
        match self {
            WriteOp::InsertMessage {
                id,
                conversation_id,
                role,
                content_json,
                status,
                seq,
                created_at,
            } => {
                dbs.instance.lock().execute(
                    "INSERT OR REPLACE INTO messages \
                     (id, conversation_id, role, content_json, status, seq, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id, conversation_id, role, content_json, status, seq, created_at],
                )?;
                Ok(())
            }
            WriteOp::UpsertConversation {
                id,
                session_id,
                agent_id,
                title,
                status,
                created_at,
                updated_at,
            } => {
                dbs.instance.lock().execute(
                    "INSERT INTO conversations \
                     (id, session_id, agent_id, title, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(id) DO UPDATE SET \
                       title = excluded.title, status = excluded.status, updated_at = excluded.updated_at",
                    rusqlite::params![id, session_id, agent_id, title, status, created_at, updated_at],
                )?;
                Ok(())
            }
            WriteOp::IndexMessageFts {
                message_id,
                conversation_id,
                body,
            } => {
                dbs.memory_fts.lock().execute(
                    "INSERT INTO message_fts (message_id, conversation_id, body) VALUES (?1, ?2, ?3)",
                    rusqlite::params![message_id, conversation_id, body],
                )?;
                Ok(())
            }
        }
    }
}

pub struct AsyncWriterConfig {
    pub max_queue_size: usize,
    pub worker_count: usize,
    pub max_retries: u32,
}

impl Default for AsyncWriterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            worker_count: 5,
            max_retries: 3,
        }
    }
}

pub struct AsyncWriter {
    tx: mpsc::Sender<WriteOp>,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

impl AsyncWriter {
    pub fn start(dbs: Arc<Databases>, config: AsyncWriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let permits = Arc::new(Semaphore::new(config.worker_count));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let rx = rx.clone();
            let dbs = dbs.clone();
            let permits = permits.clone();
            let max_retries = config.max_retries;
            workers.push(tokio::spawn(async move {
                let _permit = permits.acquire().await.expect("semaphore closed");
                loop {
                    let op = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(op) = op else { break };
                    let dbs = dbs.clone();
                    let mut attempt = 0u32;
                    loop {
                        let dbs_for_blocking = dbs.clone();
                        let op_for_blocking = op.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            op_apply(&op_for_blocking, &dbs_for_blocking)
                        })
                        .await;
                        match result {
                            Ok(Ok(())) => break,
                            Ok(Err(e)) if attempt < max_retries => {
                                attempt += 1;
                                warn!(worker_id, attempt, error = %e, "write op failed, retrying");
                            }
                            Ok(Err(e)) => {
                                error!(worker_id, error = %e, "write op dropped after max retries");
                                break;
                            }
                            Err(join_err) => {
                                error!(worker_id, error = %join_err, "write worker task panicked");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        Self { tx, _workers: workers }
    }

    /// Enqueue a write; backpressures the caller if the queue is full.
    pub async fn enqueue(&self, op: WriteOp) -> Result<()> {
        self.tx
            .send(op)
            .await
            .map_err(|_| sa_domain::error::Error::Other("storage writer shut down".into()))
    }
}

// Free function so the op can be moved into spawn_blocking without also
// moving a reference to the retry-loop's owned `WriteOp` twice.
fn op_apply(op: &WriteOp, dbs: &Databases) -> Result<()> {
    op.apply(dbs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_drain() {
        let dbs = Arc::new(Databases::open_in_memory().unwrap());
        let writer = AsyncWriter::start(dbs.clone(), AsyncWriterConfig {
            worker_count: 1,
            ..Default::default()
        });

        writer
            .enqueue(WriteOp::UpsertConversation {
                id: "c1".into(),
                session_id: "s1".into(),
                agent_id: "a1".into(),
                title: None,
                status: "active".into(),
                created_at: "2026-01-01T00:00:00Z".into(),
                updated_at: "2026-01-01T00:00:00Z".into(),
            })
            .await
            .unwrap();

        // Give the worker a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let count: i64 = dbs
            .instance
            .lock()
            .query_row("SELECT count(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
