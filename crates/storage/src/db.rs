//! Schema management for the three SQLite databases this crate owns:
//! `instance.db` (conversations + messages), `memory_fts.db` (FTS5 index
//! over message text), and `fragments.db` (extracted memory fragments).

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::Connection;

use sa_domain::error::Result;

/// Open handles to the three managed databases, each behind its own mutex
/// since `rusqlite::Connection` is not `Sync`. Blocking calls against these
/// should run inside `tokio::task::spawn_blocking`.
pub struct Databases {
    pub instance: Mutex<Connection>,
    pub memory_fts: Mutex<Connection>,
    pub fragments: Mutex<Connection>,
}

impl Databases {
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;

        let instance = Connection::open(base_dir.join("instance.db"))?;
        init_instance_schema(&instance)?;

        let memory_fts = Connection::open(base_dir.join("memory_fts.db"))?;
        init_fts_schema(&memory_fts)?;

        let fragments = Connection::open(base_dir.join("fragments.db"))?;
        init_fragments_schema(&fragments)?;

        Ok(Self {
            instance: Mutex::new(instance),
            memory_fts: Mutex::new(memory_fts),
            fragments: Mutex::new(fragments),
        })
    }

    /// In-memory databases, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let instance = Connection::open_in_memory()?;
        init_instance_schema(&instance)?;
        let memory_fts = Connection::open_in_memory()?;
        init_fts_schema(&memory_fts)?;
        let fragments = Connection::open_in_memory()?;
        init_fragments_schema(&fragments)?;
        Ok(Self {
            instance: Mutex::new(instance),
            memory_fts: Mutex::new(memory_fts),
            fragments: Mutex::new(fragments),
        })
    }
}

fn init_instance_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            session_id      TEXT NOT NULL,
            agent_id        TEXT NOT NULL,
            title           TEXT,
            status          TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_session
            ON conversations(session_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            role            TEXT NOT NULL,
            content_json    TEXT NOT NULL,
            status          TEXT NOT NULL,
            seq             INTEGER NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);
        "#,
    )?;
    Ok(())
}

fn init_fts_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
            message_id UNINDEXED,
            conversation_id UNINDEXED,
            body
        );
        "#,
    )?;
    Ok(())
}

fn init_fragments_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS fragments (
            id              TEXT PRIMARY KEY,
            session_id      TEXT NOT NULL,
            kind            TEXT NOT NULL,
            content         TEXT NOT NULL,
            metadata_json   TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fragments_session
            ON fragments(session_id, kind);
        "#,
    )?;
    Ok(())
}

pub fn default_base_dir() -> PathBuf {
    PathBuf::from("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_with_schema() {
        let dbs = Databases::open_in_memory().unwrap();
        let count: i64 = dbs
            .instance
            .lock()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='conversations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
