use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::OutputConfig;
use crate::error::ConfigError;
use crate::retry::Delivery;

pub mod clickhouse;
pub mod file;
pub mod http;

pub use clickhouse::ClickHouseSink;
pub use file::FileSink;
pub use http::{HttpSink, HttpTransport};

#[derive(Error, Debug)]
pub enum SinkError {
    /// The batch can be sent again as-is.
    #[error("delivery to {} failed: {reason}", delivery.destination)]
    Retryable {
        delivery: Box<Delivery>,
        reason: String,
    },
    /// The batch is lost.
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write one drained batch. Records are owned by this sink.
    async fn emit(&self, dataset: &str, records: Vec<Value>) -> Result<(), SinkError>;
}

/// Resolve an output by name. Unknown names and malformed options are errors.
pub fn build(name: &str, output: &OutputConfig) -> Result<Arc<dyn Sink>, ConfigError> {
    match name {
        "file" => Ok(Arc::new(FileSink::new(
            options(name, &output.options)?,
            output.chunk_size.as_u64(),
        )?)),
        "clickhouse" => Ok(Arc::new(ClickHouseSink::new(options(
            name,
            &output.options,
        )?)?)),
        "http" => Ok(Arc::new(HttpSink::new(options(name, &output.options)?)?)),
        _ => Err(ConfigError::UnknownSink(name.to_owned())),
    }
}

fn options<T: DeserializeOwned>(name: &str, options: &Map<String, Value>) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(options.clone())).map_err(|e| ConfigError::InvalidSink {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}

/// One JSON document per line, each line terminated.
pub(crate) fn ndjson<'a>(records: impl IntoIterator<Item = &'a Value>) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        // Serializing a Value into a Vec cannot fail
        serde_json::to_writer(&mut out, record).ok();
        out.push(b'\n');
    }
    out
}
