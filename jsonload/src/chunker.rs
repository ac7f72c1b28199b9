use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

/// Thresholds that make a buffer flight ready. Any one of them is enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub chunk_size: u64,
    pub max_records: usize,
    pub flush_interval: Duration,
}

struct OutputBuffer {
    // Each record is kept with its newline-delimited JSON size
    records: VecDeque<(Value, u64)>,
    size_bytes: u64,
    flight_ready: bool,
    last_flush_at: Instant,
}

/// The buffer between the input side and one sink of one dataset.
///
/// `append` only marks the buffer ready; the output loop takes the batch with
/// `drain_if_ready`. A burst appended between two drains can therefore exceed
/// the thresholds, and a drain never takes more than `max_records` records.
pub struct BatchAccumulator {
    dataset: String,
    sink: String,
    settings: BatchSettings,
    buffer: Mutex<OutputBuffer>,
}

/// Size of a record once written as a line of newline-delimited JSON.
pub fn record_size(record: &Value) -> u64 {
    serde_json::to_string(record).map_or(0, |s| s.len() as u64 + 1)
}

impl BatchAccumulator {
    pub fn new(dataset: &str, sink: &str, settings: BatchSettings) -> Self {
        Self::new_at(dataset, sink, settings, Instant::now())
    }

    pub fn new_at(dataset: &str, sink: &str, settings: BatchSettings, now: Instant) -> Self {
        Self {
            dataset: dataset.to_owned(),
            sink: sink.to_owned(),
            settings,
            buffer: Mutex::new(OutputBuffer {
                records: VecDeque::new(),
                size_bytes: 0,
                flight_ready: false,
                last_flush_at: now,
            }),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, OutputBuffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn append(&self, records: Vec<Value>) {
        self.append_at(records, Instant::now())
    }

    pub fn append_at(&self, records: Vec<Value>, now: Instant) {
        let mut buffer = self.lock();
        for record in records {
            let size = record_size(&record);
            buffer.size_bytes += size;
            buffer.records.push_back((record, size));
        }

        let by_size = buffer.size_bytes > self.settings.chunk_size;
        let by_count = buffer.records.len() >= self.settings.max_records;
        let by_time = now.saturating_duration_since(buffer.last_flush_at) > self.settings.flush_interval;
        buffer.flight_ready = by_size || by_count || by_time;

        if buffer.flight_ready {
            debug!(
                dataset = %self.dataset,
                sink = %self.sink,
                records = buffer.records.len(),
                size_bytes = buffer.size_bytes,
                by_size,
                by_count,
                by_time,
                "batch is flight ready"
            );
        }
    }

    pub fn drain_if_ready(&self) -> Option<Vec<Value>> {
        self.drain_if_ready_at(Instant::now())
    }

    /// Take up to `max_records` records if the buffer is flight ready.
    ///
    /// A non-empty buffer whose flush interval has elapsed since the last
    /// drain is ready even without a new append. A remainder that still meets
    /// the size or count threshold stays ready for the next drain.
    pub fn drain_if_ready_at(&self, now: Instant) -> Option<Vec<Value>> {
        let mut buffer = self.lock();
        if !buffer.flight_ready
            && !buffer.records.is_empty()
            && now.saturating_duration_since(buffer.last_flush_at) > self.settings.flush_interval
        {
            buffer.flight_ready = true;
        }
        if !buffer.flight_ready {
            return None;
        }

        let take = buffer.records.len().min(self.settings.max_records);
        let drained: Vec<Value> = buffer.records.drain(..take).map(|(r, _)| r).collect();
        buffer.size_bytes = buffer.records.iter().map(|(_, size)| size).sum();
        buffer.flight_ready = buffer.size_bytes > self.settings.chunk_size
            || buffer.records.len() >= self.settings.max_records;
        buffer.last_flush_at = now;

        if drained.is_empty() {
            None
        } else {
            Some(drained)
        }
    }

    /// Take everything, ready or not. Used for the final flush on shutdown.
    pub fn drain_all(&self) -> Vec<Value> {
        let mut buffer = self.lock();
        buffer.size_bytes = 0;
        buffer.flight_ready = false;
        buffer.last_flush_at = Instant::now();
        buffer.records.drain(..).map(|(r, _)| r).collect()
    }

    pub fn is_flight_ready(&self) -> bool {
        self.lock().flight_ready
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.lock().size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn settings(chunk_size: u64, max_records: usize, flush_ms: u64) -> BatchSettings {
        BatchSettings {
            chunk_size,
            max_records,
            flush_interval: Duration::from_millis(flush_ms),
        }
    }

    // A record whose newline-delimited size is exactly `n` bytes
    fn record_of_size(n: usize) -> Value {
        // {"p":""} plus newline is 9 bytes
        json!({ "p": "x".repeat(n - 9) })
    }

    #[test]
    fn test_size_trigger() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(100, 1000, 30_000), start);

        acc.append_at(vec![record_of_size(50), record_of_size(50)], start);
        assert_eq!(acc.size_bytes(), 100);
        assert!(!acc.is_flight_ready());

        acc.append_at(vec![record_of_size(10)], start);
        assert_eq!(acc.size_bytes(), 110);
        assert!(acc.is_flight_ready());
    }

    #[test]
    fn test_size_trigger_at_one_byte_over() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(100, 1000, 30_000), start);
        acc.append_at(vec![record_of_size(101)], start);
        assert!(acc.is_flight_ready());
    }

    #[test]
    fn test_count_trigger() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(1 << 20, 3, 30_000), start);

        acc.append_at(vec![json!({"a": 1}), json!({"a": 2})], start);
        assert!(!acc.is_flight_ready());
        acc.append_at(vec![json!({"a": 3})], start);
        assert!(acc.is_flight_ready());
    }

    #[test]
    fn test_time_trigger() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(1 << 20, 1000, 1000), start);

        acc.append_at(vec![json!({"a": 1})], start + Duration::from_millis(500));
        assert!(!acc.is_flight_ready());
        assert!(acc
            .drain_if_ready_at(start + Duration::from_millis(900))
            .is_none());

        acc.append_at(vec![json!({"a": 2})], start + Duration::from_millis(1001));
        assert!(acc.is_flight_ready());
    }

    #[test]
    fn test_drain_resets_state() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(1 << 20, 2, 30_000), start);

        acc.append_at(vec![json!({"a": 1}), json!({"a": 2})], start);
        let later = start + Duration::from_millis(5);
        let batch = acc.drain_if_ready_at(later).unwrap();

        assert_eq!(batch, vec![json!({"a": 1}), json!({"a": 2})]);
        assert!(!acc.is_flight_ready());
        assert_eq!(acc.size_bytes(), 0);
        assert!(acc.is_empty());
        assert!(acc.drain_if_ready_at(later).is_none());
    }

    #[test]
    fn test_remainder_drains_after_interval() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(1 << 20, 2, 1000), start);

        acc.append_at(vec![json!(1), json!(2), json!(3)], start);
        assert_eq!(acc.drain_if_ready_at(start).unwrap().len(), 2);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.size_bytes(), 2);

        // Not ready until the interval elapses again
        assert!(acc
            .drain_if_ready_at(start + Duration::from_millis(500))
            .is_none());
        assert_eq!(
            acc.drain_if_ready_at(start + Duration::from_millis(1500)),
            Some(vec![json!(3)])
        );
    }

    #[test]
    fn test_max_records_scenario() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at(
            "logs",
            "http",
            settings(1024 * 1024, 1000, 30_000),
            start,
        );

        let records: Vec<Value> = (0..1500).map(|_| record_of_size(1024)).collect();
        acc.append_at(records, start);
        assert!(acc.is_flight_ready());

        let batch = acc.drain_if_ready_at(start).unwrap();
        assert_eq!(batch.len(), 1000);
        assert_eq!(acc.len(), 500);
        assert_eq!(acc.size_bytes(), 500 * 1024);
        assert!(!acc.is_flight_ready());
    }

    #[test]
    fn test_full_remainder_stays_ready() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(1 << 30, 1000, 30_000), start);

        acc.append_at((0..2500).map(|i| json!(i)).collect(), start);
        assert_eq!(acc.drain_if_ready_at(start).unwrap().len(), 1000);
        assert!(acc.is_flight_ready());
        assert_eq!(acc.drain_if_ready_at(start).unwrap().len(), 1000);
        assert!(!acc.is_flight_ready());
        assert!(acc.drain_if_ready_at(start).is_none());
        assert_eq!(acc.len(), 500);
    }

    #[test]
    fn test_append_order_is_preserved() {
        let acc = BatchAccumulator::new("logs", "file", settings(1 << 20, 10, 30_000));
        acc.append(vec![json!(1), json!(2)]);
        acc.append(vec![json!(3)]);
        assert_eq!(acc.drain_all(), vec![json!(1), json!(2), json!(3)]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_empty_append_is_not_drained() {
        let start = Instant::now();
        let acc = BatchAccumulator::new_at("logs", "http", settings(100, 1, 10), start);
        acc.append_at(vec![], start + Duration::from_millis(50));
        assert!(acc.is_flight_ready());
        assert!(acc
            .drain_if_ready_at(start + Duration::from_millis(50))
            .is_none());
        assert!(!acc.is_flight_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_drains_never_overlap() {
        let acc = Arc::new(BatchAccumulator::new(
            "logs",
            "http",
            settings(1 << 30, 10, 30_000),
        ));
        acc.append((0..10).map(|i| json!(i)).collect());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let acc = acc.clone();
            handles.push(tokio::spawn(async move { acc.drain_if_ready() }));
        }

        let mut non_empty = 0;
        let mut seen = Vec::new();
        for handle in handles {
            if let Some(batch) = handle.await.unwrap() {
                non_empty += 1;
                seen.extend(batch);
            }
        }
        assert_eq!(non_empty, 1);
        assert_eq!(seen.len(), 10);
    }
}
