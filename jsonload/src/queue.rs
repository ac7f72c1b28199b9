use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use common_redis::{Client, CustomRedisError};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::hash::content_hash;

const PENDING_PREFIX: &str = "jsonload_preprocess_";
const PROCESSED_PREFIX: &str = "jsonload_processed_";
const PATHS_PREFIX: &str = "jsonload_paths_";

pub fn pending_key(dataset: &str) -> String {
    format!("{PENDING_PREFIX}{dataset}")
}

pub fn processed_key(dataset: &str) -> String {
    format!("{PROCESSED_PREFIX}{dataset}")
}

pub fn paths_key(dataset: &str) -> String {
    format!("{PATHS_PREFIX}{dataset}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub content_hash: String,
    pub enqueued_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    AlreadyPending,
    AlreadyProcessed,
}

/// Per-dataset FIFO of discovered files, deduplicated by content hash.
///
/// Pending members are content hashes scored by enqueue time. A hash found in
/// the processed set is never enqueued again.
pub struct WorkQueue {
    client: Arc<dyn Client + Send + Sync>,
    last_score: AtomicI64,
}

impl WorkQueue {
    pub fn new(client: Arc<dyn Client + Send + Sync>) -> Self {
        Self {
            client,
            last_score: AtomicI64::new(0),
        }
    }

    // Millisecond timestamps, strictly increasing for this instance
    fn next_score(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last_score.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self
                .last_score
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    async fn hash(path: &Path) -> Result<String, QueueError> {
        content_hash(path).await.map_err(|source| QueueError::Hash {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn enqueue_if_new(
        &self,
        dataset: &str,
        path: &Path,
    ) -> Result<EnqueueOutcome, QueueError> {
        let hash = Self::hash(path).await?;

        if self
            .client
            .zscore(processed_key(dataset), hash.clone())
            .await?
            .is_some()
        {
            debug!(dataset, path = %path.display(), "file has already been processed, skipping");
            return Ok(EnqueueOutcome::AlreadyProcessed);
        }

        self.client
            .hset_nx(
                paths_key(dataset),
                hash.clone(),
                path.to_string_lossy().into_owned(),
            )
            .await?;
        let added = self
            .client
            .zadd_nx(pending_key(dataset), hash, self.next_score())
            .await?;

        if added {
            debug!(dataset, path = %path.display(), "file added to queue");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            Ok(EnqueueOutcome::AlreadyPending)
        }
    }

    /// Pop up to `max_count` items, oldest first.
    pub async fn dequeue_batch(
        &self,
        dataset: &str,
        max_count: usize,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let queue_length = self.client.zcard(pending_key(dataset)).await?;
        let count = queue_length.min(max_count as u64);
        if count == 0 {
            return Ok(vec![]);
        }
        debug!(dataset, queue_length, "files waiting to process");

        let popped = self.client.zpopmin(pending_key(dataset), count).await?;
        let mut items = Vec::with_capacity(popped.len());
        for (hash, score) in popped {
            match self.client.hget(paths_key(dataset), hash.clone()).await {
                Ok(path) => {
                    self.client.hdel(paths_key(dataset), hash.clone()).await?;
                    items.push(WorkItem {
                        path: PathBuf::from(path),
                        content_hash: hash,
                        enqueued_at_ms: score,
                    });
                }
                Err(CustomRedisError::NotFound) => {
                    warn!(dataset, hash = %hash, "no path recorded for queued file, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(items)
    }

    /// Record the file's current content as processed. Idempotent.
    pub async fn mark_processed(&self, dataset: &str, path: &Path) -> Result<(), QueueError> {
        let hash = Self::hash(path).await?;
        let now = chrono::Utc::now().timestamp_millis();
        self.client.zadd_gt(processed_key(dataset), hash, now).await?;
        info!(dataset, path = %path.display(), "marked file as processed");
        Ok(())
    }

    pub async fn is_processed(&self, dataset: &str, path: &Path) -> Result<bool, QueueError> {
        let hash = Self::hash(path).await?;
        Ok(self
            .client
            .zscore(processed_key(dataset), hash)
            .await?
            .is_some())
    }

    pub async fn pending(&self, dataset: &str) -> Result<u64, QueueError> {
        Ok(self.client.zcard(pending_key(dataset)).await?)
    }
}
