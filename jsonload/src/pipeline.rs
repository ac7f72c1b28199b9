use std::sync::Arc;
use std::time::Duration;

use common_redis::Client;
use health::HealthRegistry;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chunker::BatchAccumulator;
use crate::config::{Config, DatasetConfig};
use crate::error::{ConfigError, PipelineError, QueueError, SourceError};
use crate::poll::PollLoop;
use crate::queue::{EnqueueOutcome, WorkQueue};
use crate::retry::{PauseSignal, RetryCoordinator, SweepReport, Transport};
use crate::sinks::{self, HttpTransport, Sink, SinkError};
use crate::source::{read_records, FileSource};
use crate::transform::TransformChain;

/// Polling delays of each stage.
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub input: Duration,
    pub output: Duration,
    pub retry: Duration,
    pub rescan: Duration,
    pub liveness_deadline: Duration,
}

impl Intervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            input: config.input_poll_interval.0,
            output: config.output_poll_interval.0,
            retry: config.retry_poll_interval.0,
            rescan: config.rescan_interval.0,
            liveness_deadline: config.liveness_deadline.0,
        }
    }
}

/// A sink and the buffer feeding it.
pub struct Output {
    pub sink: Arc<dyn Sink>,
    pub buffer: Arc<BatchAccumulator>,
}

pub struct Dataset {
    pub name: String,
    pub source: FileSource,
    pub max_files: usize,
    pub chain: TransformChain,
    pub outputs: Vec<Output>,
    pub retry: Arc<RetryCoordinator>,
}

impl Dataset {
    /// Resolve every plugin of a dataset. The input directory must be readable.
    pub fn from_config(
        name: &str,
        config: &DatasetConfig,
        transport: Arc<dyn Transport>,
        pause: PauseSignal,
    ) -> Result<Self, ConfigError> {
        let root = config.input_path(name)?;
        let source = FileSource::new(root, &config.inputs.file.file_extension);
        source.ensure_readable().map_err(|e| match e {
            SourceError::Open { path, source } | SourceError::Scan { path, source } => {
                ConfigError::UnreadableInput {
                    dataset: name.to_owned(),
                    path,
                    source,
                }
            }
        })?;

        let chain = TransformChain::from_config(name, &config.transforms)?;

        let mut sink_names: Vec<&String> = config.outputs.keys().collect();
        sink_names.sort();
        let mut outputs = Vec::with_capacity(sink_names.len());
        for sink_name in sink_names {
            let output = &config.outputs[sink_name];
            let settings = output.batch_settings(sink_name)?;
            outputs.push(Output {
                sink: sinks::build(sink_name, output)?,
                buffer: Arc::new(BatchAccumulator::new(name, sink_name, settings)),
            });
        }
        if outputs.is_empty() {
            warn!(dataset = name, "no outputs configured, records will be discarded");
        }

        let retry = Arc::new(RetryCoordinator::new(
            name,
            config.retry.policy(),
            config.retry.max_retry_count,
            config.retry.max_queue_size.as_u64(),
            transport,
            pause,
        ));

        Ok(Self {
            name: name.to_owned(),
            source,
            max_files: config.inputs.file.read_max_number_of_files,
            chain,
            outputs,
            retry,
        })
    }

    /// Give every output its own copy of the records.
    pub fn append(&self, records: Vec<Value>) {
        if let Some((last, rest)) = self.outputs.split_last() {
            for output in rest {
                output.buffer.append(records.clone());
            }
            last.buffer.append(records);
        }
    }

    fn labels(&self) -> [(String, String); 1] {
        [("dataset".to_string(), self.name.clone())]
    }
}

fn output_labels(dataset: &Dataset, output: &Output) -> [(String, String); 2] {
    [
        ("dataset".to_string(), dataset.name.clone()),
        ("sink".to_string(), output.sink.name().to_string()),
    ]
}

pub struct Pipeline {
    queue: Arc<WorkQueue>,
    datasets: Vec<Arc<Dataset>>,
    pause: PauseSignal,
    intervals: Intervals,
    liveness: HealthRegistry,
    stop: watch::Sender<bool>,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn Client + Send + Sync>,
        datasets: Vec<Dataset>,
        pause: PauseSignal,
        intervals: Intervals,
        liveness: HealthRegistry,
    ) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(client)),
            datasets: datasets.into_iter().map(Arc::new).collect(),
            pause,
            intervals,
            liveness,
            stop: watch::channel(false).0,
        }
    }

    /// Build every selected dataset, sharing one pause signal and one retry transport.
    pub fn build(
        client: Arc<dyn Client + Send + Sync>,
        configs: &[(String, DatasetConfig)],
        intervals: Intervals,
        liveness: HealthRegistry,
    ) -> Result<Self, ConfigError> {
        let pause = PauseSignal::new();
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(sinks::http::DEFAULT_TIMEOUT).map_err(|e| {
                ConfigError::InvalidSink {
                    name: "http".to_string(),
                    reason: e.to_string(),
                }
            })?,
        );
        let datasets = configs
            .iter()
            .map(|(name, config)| Dataset::from_config(name, config, transport.clone(), pause.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(client, datasets, pause, intervals, liveness))
    }

    /// Ask every spawned loop to return once its current tick is done.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn pause(&self) -> &PauseSignal {
        &self.pause
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn datasets(&self) -> &[Arc<Dataset>] {
        &self.datasets
    }

    pub fn dataset(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// Scan the input directory and enqueue every file not seen before.
    pub async fn discover(&self, dataset: &Dataset) -> Result<usize, PipelineError> {
        let files = dataset.source.scan().await?;
        let mut enqueued = 0;
        for path in files {
            match self.queue.enqueue_if_new(&dataset.name, &path).await {
                Ok(EnqueueOutcome::Enqueued) => enqueued += 1,
                Ok(_) => {}
                Err(e @ QueueError::Hash { .. }) => {
                    warn!(dataset = %dataset.name, error = %e, "skipping file until the next scan");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let labels = dataset.labels();
        common_metrics::inc("jsonload_files_enqueued_total", &labels, enqueued as u64);
        let depth = self.queue.pending(&dataset.name).await?;
        common_metrics::gauge("jsonload_queue_depth", &labels, depth as f64);
        if enqueued > 0 {
            info!(dataset = %dataset.name, enqueued, depth, "discovered new files");
        }
        Ok(enqueued)
    }

    /// Read, transform and buffer the next batch of queued files.
    pub async fn process_input(&self, dataset: &Dataset) -> Result<usize, PipelineError> {
        let items = self
            .queue
            .dequeue_batch(&dataset.name, dataset.max_files)
            .await?;
        let labels = dataset.labels();
        let mut processed = 0;

        for item in items {
            let decoded = match read_records(&item.path).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(dataset = %dataset.name, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            if decoded.skipped_lines > 0 {
                common_metrics::inc("jsonload_lines_skipped_total", &labels, decoded.skipped_lines as u64);
            }
            if decoded.truncated {
                warn!(
                    dataset = %dataset.name,
                    path = %item.path.display(),
                    records = decoded.records.len(),
                    "file ended with a decode error, keeping the records read so far"
                );
            }

            let read = decoded.records.len();
            let records = dataset.chain.apply(decoded.records);
            debug!(
                dataset = %dataset.name,
                path = %item.path.display(),
                read,
                transformed = records.len(),
                "buffering records"
            );
            dataset.append(records);

            match self.queue.mark_processed(&dataset.name, &item.path).await {
                Ok(()) => {
                    processed += 1;
                    common_metrics::inc("jsonload_files_processed_total", &labels, 1);
                }
                Err(e @ QueueError::Hash { .. }) => {
                    warn!(dataset = %dataset.name, error = %e, "could not mark file as processed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(processed)
    }

    /// Hand a ready batch to the sink. Returns whether a batch was taken.
    pub async fn flush_output(&self, dataset: &Dataset, output: &Output) -> Result<bool, PipelineError> {
        let Some(batch) = output.buffer.drain_if_ready() else {
            return Ok(false);
        };
        let labels = output_labels(dataset, output);
        let records = batch.len();
        common_metrics::histogram("jsonload_batch_records", &labels, records as f64);

        match output.sink.emit(&dataset.name, batch).await {
            Ok(()) => {
                common_metrics::inc("jsonload_batches_emitted_total", &labels, 1);
            }
            Err(SinkError::Retryable { delivery, reason }) => {
                common_metrics::inc("jsonload_sink_failures_total", &labels, 1);
                warn!(dataset = %dataset.name, sink = output.sink.name(), records, reason = %reason, "batch delivery failed");
                dataset.retry.record_failure(*delivery);
            }
            Err(SinkError::Failed(reason)) => {
                common_metrics::inc("jsonload_sink_failures_total", &labels, 1);
                debug!(dataset = %dataset.name, sink = output.sink.name(), reason = %reason, "batch not retried");
            }
        }
        Ok(true)
    }

    pub async fn sweep_retries(&self, dataset: &Dataset) -> Result<SweepReport, PipelineError> {
        dataset.retry.sweep().await
    }

    /// Start one loop per (stage, key) into `tasks`.
    ///
    /// Each loop ends on a fatal error or after `stop`.
    pub fn spawn(self: &Arc<Self>, tasks: &mut JoinSet<Result<(), PipelineError>>) {
        let deadline = self.intervals.liveness_deadline;
        for dataset in &self.datasets {
            let name = &dataset.name;

            let input = PollLoop::new("input", name.clone(), self.intervals.input)
                .with_pause(self.pause.clone())
                .with_stop(self.stop.subscribe())
                .with_liveness(self.liveness.register(format!("input:{name}"), deadline));
            let (pipeline, ds) = (self.clone(), dataset.clone());
            tasks.spawn(input.run(move || {
                let (pipeline, ds) = (pipeline.clone(), ds.clone());
                async move { pipeline.process_input(&ds).await.map(|_| ()) }
            }));

            let rescan = PollLoop::new("rescan", name.clone(), self.intervals.rescan)
                .with_stop(self.stop.subscribe())
                .with_liveness(self.liveness.register(format!("rescan:{name}"), deadline));
            let (pipeline, ds) = (self.clone(), dataset.clone());
            tasks.spawn(rescan.run(move || {
                let (pipeline, ds) = (pipeline.clone(), ds.clone());
                async move { pipeline.discover(&ds).await.map(|_| ()) }
            }));

            let retry = PollLoop::new("retry", name.clone(), self.intervals.retry)
                .with_stop(self.stop.subscribe())
                .with_liveness(self.liveness.register(format!("retry:{name}"), deadline));
            let (pipeline, ds) = (self.clone(), dataset.clone());
            tasks.spawn(retry.run(move || {
                let (pipeline, ds) = (pipeline.clone(), ds.clone());
                async move { pipeline.sweep_retries(&ds).await.map(|_| ()) }
            }));

            for (index, output) in dataset.outputs.iter().enumerate() {
                let sink = output.sink.name();
                let key = format!("{name}:{sink}");
                let flush = PollLoop::new("output", key.clone(), self.intervals.output)
                    .with_stop(self.stop.subscribe())
                    .with_liveness(self.liveness.register(format!("output:{key}"), deadline));
                let (pipeline, ds) = (self.clone(), dataset.clone());
                tasks.spawn(flush.run(move || {
                    let (pipeline, ds) = (pipeline.clone(), ds.clone());
                    async move {
                        pipeline
                            .flush_output(&ds, &ds.outputs[index])
                            .await
                            .map(|_| ())
                    }
                }));
            }
        }
    }

    /// Push every buffered record through its sink once. Used on shutdown,
    /// when nothing is left to retry failed deliveries.
    pub async fn flush_all(&self) {
        for dataset in &self.datasets {
            for output in &dataset.outputs {
                let batch = output.buffer.drain_all();
                if batch.is_empty() {
                    continue;
                }
                let records = batch.len();
                match output.sink.emit(&dataset.name, batch).await {
                    Ok(()) => info!(dataset = %dataset.name, sink = output.sink.name(), records, "flushed buffer"),
                    Err(e) => error!(
                        dataset = %dataset.name,
                        sink = output.sink.name(),
                        records,
                        error = %e,
                        "final flush failed, records are lost"
                    ),
                }
            }
            let pending = dataset.retry.pending();
            if pending > 0 {
                error!(dataset = %dataset.name, pending, "shutting down with pending retries, payloads are lost");
            }
        }
    }
}
