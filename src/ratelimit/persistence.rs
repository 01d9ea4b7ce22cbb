//! Background write queue for rate limit buckets.
//!
//! Limiters never await a database write. Snapshots go into a bounded
//! channel; a single task drains it, keeps only the newest snapshot per
//! bucket and writes with bounded exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::ratelimit::bucket::BucketRecord;
use crate::repositories::BucketStore;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistPolicy {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default)]
struct PersistCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Counters for the bucket write queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub submitted: u64,
    /// Snapshots discarded because the queue was full or closed.
    pub dropped: u64,
    pub written: u64,
    /// Writes abandoned after exhausting retries.
    pub failed: u64,
}

#[derive(Clone)]
pub struct BucketPersister {
    store: Arc<dyn BucketStore>,
    tx: mpsc::Sender<BucketRecord>,
    counters: Arc<PersistCounters>,
}

impl BucketPersister {
    /// Starts the writer task. It exits once every persister clone is dropped
    /// and the queue is drained.
    pub fn spawn(store: Arc<dyn BucketStore>, policy: PersistPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(policy.queue_capacity.max(1));
        let counters = Arc::new(PersistCounters::default());
        let handle = tokio::spawn(write_loop(store.clone(), rx, policy, counters.clone()));

        (
            Self {
                store,
                tx,
                counters,
            },
            handle,
        )
    }

    pub async fn load(&self, name: &str) -> AppResult<Option<BucketRecord>> {
        self.store.load(name).await
    }

    /// Queues a snapshot without waiting.
    pub fn submit(&self, record: BucketRecord) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(bucket = %record.name, "Bucket write queue full, dropping snapshot");
            }
            Err(TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(bucket = %record.name, "Bucket write queue closed, dropping snapshot");
            }
        }
    }

    pub fn stats(&self) -> PersistStats {
        PersistStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BucketPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketPersister")
            .field("stats", &self.stats())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

async fn write_loop(
    store: Arc<dyn BucketStore>,
    mut rx: mpsc::Receiver<BucketRecord>,
    policy: PersistPolicy,
    counters: Arc<PersistCounters>,
) {
    while let Some(first) = rx.recv().await {
        let mut latest = HashMap::new();
        latest.insert(first.name.clone(), first);
        while let Ok(next) = rx.try_recv() {
            latest.insert(next.name.clone(), next);
        }

        for record in latest.into_values() {
            if save_with_retry(store.as_ref(), record, &policy).await {
                counters.written.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("Bucket write queue closed");
}

async fn save_with_retry(store: &dyn BucketStore, record: BucketRecord, policy: &PersistPolicy) -> bool {
    let mut delay = policy.retry_delay;
    let mut attempt = 0;

    loop {
        match store.save(record.clone()).await {
            Ok(()) => return true,
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                debug!(
                    bucket = %record.name,
                    attempt,
                    error = %e,
                    "Bucket write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                warn!(
                    bucket = %record.name,
                    attempts = attempt + 1,
                    error = %e,
                    "Failed to persist rate limit bucket"
                );
                return false;
            }
        }
    }
}
