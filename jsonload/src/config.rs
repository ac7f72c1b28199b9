use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::chunker::BatchSettings;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::size::ByteSize;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "1000")]
    pub redis_response_timeout_ms: EnvMsDuration,

    #[envconfig(default = "jsonload.json")]
    pub datasets_config_path: String,

    #[envconfig(default = "100")]
    pub input_poll_interval: EnvMsDuration,

    #[envconfig(default = "10")]
    pub output_poll_interval: EnvMsDuration,

    #[envconfig(default = "100")]
    pub retry_poll_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub rescan_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl std::fmt::Display for ParseLogFormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown log format {:?}, expected text or json", self.0)
    }
}

impl std::error::Error for ParseLogFormatError {}

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ParseLogFormatError(s.to_owned())),
        }
    }
}

/// The datasets file: `{"datasets": {"NAME": {...}}}`.
#[derive(Debug, Deserialize)]
pub struct DatasetsFile {
    pub datasets: HashMap<String, DatasetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub inputs: InputsConfig,
    /// Ordered steps, each a single-key object naming the transform.
    #[serde(default)]
    pub transforms: Vec<Map<String, Value>>,
    pub outputs: HashMap<String, OutputConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputsConfig {
    pub file: FileInputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInputConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_read_max_number_of_files")]
    pub read_max_number_of_files: usize,
}

fn default_file_extension() -> String {
    ".json.gz".to_string()
}

fn default_read_max_number_of_files() -> usize {
    50
}

/// Options shared by every sink, plus the sink specific ones in `options`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

fn default_chunk_size() -> ByteSize {
    ByteSize::mib(10)
}

fn default_max_records() -> usize {
    100_000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl OutputConfig {
    pub fn batch_settings(&self, sink: &str) -> Result<BatchSettings, ConfigError> {
        if self.max_records == 0 {
            return Err(ConfigError::InvalidSink {
                name: sink.to_owned(),
                reason: "max_records must be at least 1".to_string(),
            });
        }
        Ok(BatchSettings {
            chunk_size: self.chunk_size.as_u64(),
            max_records: self.max_records,
            flush_interval: time::Duration::from_millis(self.flush_interval_ms),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: ByteSize,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: u32,
    #[serde(default)]
    pub maximum_interval_ms: Option<u64>,
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_max_queue_size() -> ByteSize {
    ByteSize::gib(1)
}

fn default_initial_interval_ms() -> u64 {
    10_000
}

fn default_backoff_coefficient() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            max_queue_size: default_max_queue_size(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            maximum_interval_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(
            self.backoff_coefficient,
            time::Duration::from_millis(self.initial_interval_ms),
        );
        match self.maximum_interval_ms {
            Some(ms) => builder.maximum_interval(time::Duration::from_millis(ms)),
            None => builder,
        }
        .provide()
    }
}

impl DatasetsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Resolve the requested names, in order. Unknown names are fatal.
    pub fn select(&self, names: &[String]) -> Result<Vec<(String, DatasetConfig)>, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::NoDatasets);
        }
        names
            .iter()
            .map(|name| {
                self.datasets
                    .get(name)
                    .map(|ds| (name.clone(), ds.clone()))
                    .ok_or_else(|| ConfigError::UnknownDataset(name.clone()))
            })
            .collect()
    }
}

impl DatasetConfig {
    /// The input directory, which must be set and non-empty.
    pub fn input_path(&self, dataset: &str) -> Result<PathBuf, ConfigError> {
        match self.inputs.file.path.as_deref() {
            Some(path) if !path.trim().is_empty() => Ok(PathBuf::from(path)),
            _ => Err(ConfigError::MissingInputPath(dataset.to_owned())),
        }
    }
}
