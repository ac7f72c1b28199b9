use std::io;
use std::path::PathBuf;

use common_redis::CustomRedisError;
use thiserror::Error;

/// Errors found while loading or validating configuration. All of them stop the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read datasets config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse datasets config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no dataset names given")]
    NoDatasets,
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),
    #[error("dataset {0}: no path value in the file input")]
    MissingInputPath(String),
    #[error("dataset {dataset}: input path {path} is not readable: {source}")]
    UnreadableInput {
        dataset: String,
        path: PathBuf,
        source: io::Error,
    },
    #[error("unknown transform {0:?}")]
    UnknownTransform(String),
    #[error("invalid config for transform {name}: {reason}")]
    InvalidTransform { name: String, reason: String },
    #[error("unknown sink {0:?}")]
    UnknownSink(String),
    #[error("invalid config for sink {name}: {reason}")]
    InvalidSink { name: String, reason: String },
    #[error("invalid size {0:?}, use a value like 100KB, 10MB or 1GB")]
    InvalidSize(String),
}

/// Errors from the work queue: hashing a file or talking to the store.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to hash {path}: {source}")]
    Hash { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Store(#[from] CustomRedisError),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to scan {path}: {source}")]
    Scan { path: PathBuf, source: io::Error },
}

/// Errors from sending a payload over the network.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
}

/// Errors surfaced by a pipeline stage. A fatal error stops the process,
/// anything else is logged and the stage keeps ticking.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("dataset {dataset}: retry queue size {bytes} bytes exceeded the limit of {limit} bytes")]
    RetryCeiling {
        dataset: String,
        bytes: u64,
        limit: u64,
    },
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Config(_) => true,
            PipelineError::Queue(QueueError::Store(err)) => err.is_unrecoverable_error(),
            PipelineError::Queue(QueueError::Hash { .. }) => false,
            PipelineError::Source(_) => false,
            PipelineError::RetryCeiling { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::RedisErrorKind;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::from(ConfigError::NoDatasets).is_fatal());
        assert!(PipelineError::RetryCeiling {
            dataset: "logs".to_string(),
            bytes: 2,
            limit: 1,
        }
        .is_fatal());

        let hash = QueueError::Hash {
            path: PathBuf::from("/tmp/a.json.gz"),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert!(!PipelineError::from(hash).is_fatal());

        let timeout = QueueError::Store(CustomRedisError::Timeout);
        assert!(!PipelineError::from(timeout).is_fatal());

        let auth = QueueError::Store(CustomRedisError::from_redis_kind(
            RedisErrorKind::AuthenticationFailed,
            "bad password",
        ));
        assert!(PipelineError::from(auth).is_fatal());
    }
}
