//! Batch accumulator that commits a group of same-shaped items together,
//! flushing when the buffer grows past a size threshold or its oldest item
//! grows past an age threshold. Direct translation of the Python original's
//! `BatchWriter` (`infra/storage/batch_writer.py`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
    pub min_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait_time: Duration::from_secs(5),
            min_batch_size: 10,
        }
    }
}

struct BatchItem<T> {
    data: T,
    added_at: Instant,
    retries: u32,
}

#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub items_added: u64,
    pub batches_flushed: u64,
    pub items_flushed: u64,
    pub flush_errors: u64,
    pub last_flush_size: usize,
}

/// `batch_operation` performs the actual commit for a drained batch. It may
/// fail; failed items are requeued up to 3 retries and then dropped.
pub type BatchOperation<T> =
    Arc<dyn Fn(Vec<T>) -> futures_util::future::BoxFuture<'static, Result<(), String>> + Send + Sync>;

pub struct BatchWriter<T: Send + 'static> {
    buffer: Mutex<Vec<BatchItem<T>>>,
    config: BatchConfig,
    operation: BatchOperation<T>,
    stats: Mutex<BatchStats>,
    flush_notify: Notify,
}

impl<T: Send + Clone + 'static> BatchWriter<T> {
    pub fn new(config: BatchConfig, operation: BatchOperation<T>) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
            config,
            operation,
            stats: Mutex::new(BatchStats::default()),
            flush_notify: Notify::new(),
        })
    }

    /// Spawn the background auto-flush loop. Call once per writer instance.
    pub fn spawn_auto_flush(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(this.config.max_wait_time) => {}
                    _ = this.flush_notify.notified() => {}
                }
                if this.should_flush() {
                    this.flush().await;
                }
            }
        })
    }

    fn should_flush(&self) -> bool {
        let buffer = self.buffer.lock();
        if buffer.is_empty() {
            return false;
        }
        if buffer.len() >= self.config.min_batch_size {
            return true;
        }
        buffer
            .first()
            .is_some_and(|item| item.added_at.elapsed() >= self.config.max_wait_time)
    }

    /// Add an item; triggers an immediate flush once the hard size cap is hit.
    pub async fn add(&self, data: T) {
        let should_flush_now = {
            let mut buffer = self.buffer.lock();
            buffer.push(BatchItem {
                data,
                added_at: Instant::now(),
                retries: 0,
            });
            self.stats.lock().items_added += 1;
            buffer.len() >= self.config.max_batch_size
        };
        if should_flush_now {
            self.flush_notify.notify_one();
        }
    }

    pub async fn flush(&self) {
        let items: Vec<BatchItem<T>> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if items.is_empty() {
            return;
        }
        let size = items.len();
        let data: Vec<T> = items.iter().map(|i| i.data.clone()).collect();

        match (self.operation)(data).await {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.batches_flushed += 1;
                stats.items_flushed += size as u64;
                stats.last_flush_size = size;
            }
            Err(err) => {
                error!(error = %err, items = size, "batch flush failed");
                self.stats.lock().flush_errors += 1;
                let mut requeued = 0usize;
                let mut dropped = 0usize;
                let mut buffer = self.buffer.lock();
                for mut item in items {
                    if item.retries < 3 {
                        item.retries += 1;
                        buffer.push(item);
                        requeued += 1;
                    } else {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    warn!(dropped, "dropped batch items after exhausting retries");
                }
                let _ = requeued;
            }
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Flush whatever remains; call during shutdown.
    pub async fn shutdown(&self) {
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn flushes_on_min_batch_size() {
        let committed = Arc::new(AtomicUsize::new(0));
        let committed2 = committed.clone();
        let op: BatchOperation<i32> = Arc::new(move |items| {
            let committed = committed2.clone();
            Box::pin(async move {
                committed.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            })
        });
        let writer = BatchWriter::new(
            BatchConfig {
                max_batch_size: 100,
                max_wait_time: Duration::from_secs(60),
                min_batch_size: 3,
            },
            op,
        );
        for i in 0..3 {
            writer.add(i).await;
        }
        assert!(writer.should_flush());
        writer.flush().await;
        assert_eq!(committed.load(Ordering::SeqCst), 3);
        assert_eq!(writer.buffer_len(), 0);
    }

    #[tokio::test]
    async fn requeues_on_failure_up_to_three_times() {
        let op: BatchOperation<i32> = Arc::new(|_items| Box::pin(async move { Err("boom".into()) }));
        let writer = BatchWriter::new(BatchConfig::default(), op);
        writer.add(1).await;
        writer.flush().await;
        assert_eq!(writer.buffer_len(), 1);
        assert_eq!(writer.stats().flush_errors, 1);
    }
}
