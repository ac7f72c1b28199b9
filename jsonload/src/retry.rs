//! # Retry
//!
//! Failed network deliveries wait here with exponential backoff. While any
//! dataset has a pending retry the process-wide `PauseSignal` is held, which
//! stops every input loop from draining its work queue.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{self, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, PipelineError};

#[derive(Clone, Debug)]
/// A retry policy to determine how long a failed delivery waits.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine interval for retrying at a given attempt number, starting at 1.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(10),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

/// Process-wide backpressure flag. Held by retry coordinators, read by input loops.
#[derive(Clone, Default)]
pub struct PauseSignal {
    paused: Arc<AtomicBool>,
    holders: Arc<Mutex<HashSet<String>>>,
}

impl PauseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn holders(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.holders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn hold(&self, dataset: &str) {
        let mut holders = self.holders();
        if holders.insert(dataset.to_owned()) {
            warn!(dataset, "pausing input queues while retries are pending");
        }
        self.paused.store(true, Ordering::Release);
        metrics::gauge!("jsonload_input_paused").set(1.0);
    }

    pub(crate) fn release(&self, dataset: &str) {
        let mut holders = self.holders();
        if holders.remove(dataset) {
            info!(dataset, "retry queue is empty");
        }
        if holders.is_empty() && self.paused.swap(false, Ordering::AcqRel) {
            info!("resuming input queues");
            metrics::gauge!("jsonload_input_paused").set(0.0);
        }
    }
}

/// Everything needed to send a batch again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub destination: String,
    pub headers: HashMap<String, String>,
    /// Overrides the transport's own request timeout.
    pub timeout: Option<time::Duration>,
}

impl Delivery {
    pub fn estimated_size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.payload.len() + self.destination.len() + headers) as u64
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub attempt_count: u32,
    pub delivery: Delivery,
    pub last_attempt_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    pub pending: usize,
}

/// Pending retries of one dataset.
pub struct RetryCoordinator {
    dataset: String,
    policy: RetryPolicy,
    max_retry_count: u32,
    max_queue_bytes: u64,
    transport: Arc<dyn Transport>,
    pause: PauseSignal,
    entries: Mutex<HashMap<Uuid, RetryEntry>>,
}

impl RetryCoordinator {
    pub fn new(
        dataset: &str,
        policy: RetryPolicy,
        max_retry_count: u32,
        max_queue_bytes: u64,
        transport: Arc<dyn Transport>,
        pause: PauseSignal,
    ) -> Self {
        Self {
            dataset: dataset.to_owned(),
            policy,
            max_retry_count,
            max_queue_bytes,
            transport,
            pause,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, RetryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_failure(&self, delivery: Delivery) -> Uuid {
        self.record_failure_at(delivery, Instant::now())
    }

    /// Queue a delivery that failed on its first attempt.
    pub fn record_failure_at(&self, delivery: Delivery, now: Instant) -> Uuid {
        let id = Uuid::now_v7();
        warn!(
            dataset = %self.dataset,
            retry_id = %id,
            destination = %delivery.destination,
            bytes = delivery.payload.len(),
            "delivery failed, queued for retry"
        );
        let mut entries = self.entries();
        entries.insert(
            id,
            RetryEntry {
                attempt_count: 0,
                delivery,
                last_attempt_at: now,
            },
        );
        // Still under the entries lock, as in `sweep_at`
        self.pause.hold(&self.dataset);
        id
    }

    /// When the entry may be attempted again.
    pub fn next_eligible_at(&self, entry: &RetryEntry) -> Instant {
        entry.last_attempt_at + self.policy.retry_interval(entry.attempt_count + 1)
    }

    pub fn pending(&self) -> usize {
        self.entries().len()
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.entries()
            .values()
            .map(|e| e.delivery.estimated_size())
            .sum()
    }

    pub fn entry(&self, id: &Uuid) -> Option<RetryEntry> {
        self.entries().get(id).cloned()
    }

    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        self.sweep_at(Instant::now()).await
    }

    /// Attempt every entry whose backoff has elapsed.
    ///
    /// Fails when the pending entries exceed the configured byte ceiling.
    pub async fn sweep_at(&self, now: Instant) -> Result<SweepReport, PipelineError> {
        let bytes = self.estimated_bytes();
        let labels = [("dataset".to_string(), self.dataset.clone())];
        common_metrics::gauge("jsonload_retry_queue_bytes", &labels, bytes as f64);
        if bytes > self.max_queue_bytes {
            error!(
                dataset = %self.dataset,
                bytes,
                limit = self.max_queue_bytes,
                "retry queue size exceeded, failing hard"
            );
            return Err(PipelineError::RetryCeiling {
                dataset: self.dataset.clone(),
                bytes,
                limit: self.max_queue_bytes,
            });
        }

        let mut report = SweepReport::default();
        let eligible: Vec<(Uuid, Delivery)> = {
            let mut entries = self.entries();
            if entries.is_empty() {
                self.pause.release(&self.dataset);
                return Ok(report);
            }
            self.pause.hold(&self.dataset);

            let exhausted: Vec<Uuid> = entries
                .iter()
                .filter(|(_, e)| e.attempt_count >= self.max_retry_count)
                .map(|(id, _)| *id)
                .collect();
            for id in exhausted {
                if let Some(entry) = entries.remove(&id) {
                    self.report_loss(&id, &entry);
                    report.dropped += 1;
                }
            }

            entries
                .iter()
                .filter(|(_, e)| now >= self.next_eligible_at(e))
                .map(|(id, e)| (*id, e.delivery.clone()))
                .collect()
        };

        for (id, delivery) in eligible {
            debug!(dataset = %self.dataset, retry_id = %id, "retrying delivery");
            let result = self.transport.deliver(&delivery).await;

            let mut entries = self.entries();
            match result {
                Ok(()) => {
                    entries.remove(&id);
                    report.delivered += 1;
                    info!(dataset = %self.dataset, retry_id = %id, "retry delivered");
                    self.count_retry("delivered");
                }
                Err(err) => {
                    report.failed += 1;
                    self.count_retry("failed");
                    let Some(entry) = entries.get_mut(&id) else {
                        continue;
                    };
                    entry.attempt_count += 1;
                    entry.last_attempt_at = now;
                    error!(
                        dataset = %self.dataset,
                        retry_id = %id,
                        attempt = entry.attempt_count,
                        max_retry_count = self.max_retry_count,
                        error = %err,
                        "retry failed"
                    );
                    if entry.attempt_count >= self.max_retry_count {
                        if let Some(entry) = entries.remove(&id) {
                            self.report_loss(&id, &entry);
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        let entries = self.entries();
        report.pending = entries.len();
        if report.pending == 0 {
            self.pause.release(&self.dataset);
        }
        Ok(report)
    }

    fn report_loss(&self, id: &Uuid, entry: &RetryEntry) {
        error!(
            dataset = %self.dataset,
            retry_id = %id,
            destination = %entry.delivery.destination,
            bytes = entry.delivery.payload.len(),
            attempts = entry.attempt_count,
            "max retry count exceeded, the payload is lost"
        );
        self.count_retry("dropped");
    }

    fn count_retry(&self, outcome: &str) {
        let labels = [
            ("dataset".to_string(), self.dataset.clone()),
            ("outcome".to_string(), outcome.to_string()),
        ];
        common_metrics::inc("jsonload_retries_total", &labels, 1);
    }
}
