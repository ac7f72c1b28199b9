use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Sink, SinkError};
use crate::error::{ConfigError, DeliveryError};
use crate::retry::{Delivery, Transport};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkOptions {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

/// POSTs a delivery. Anything but a 2xx response is an error.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let mut headers = HeaderMap::try_from(&delivery.headers)
            .map_err(|e| DeliveryError::InvalidHeader(e.to_string()))?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = delivery.destination.clone();
        let mut request = self
            .client
            .post(&delivery.destination)
            .headers(headers)
            .body(delivery.payload.clone());
        if let Some(timeout) = delivery.timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|source| DeliveryError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Wraps every record as `{"message_raw": <record>}`, one per line.
pub fn message_raw_payload(records: &[Value]) -> Bytes {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(b"{\"message_raw\": ");
        serde_json::to_writer(&mut out, record).ok();
        out.extend_from_slice(b"}\n");
    }
    Bytes::from(out)
}

pub struct HttpSink {
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    transport: HttpTransport,
}

impl HttpSink {
    pub fn new(options: HttpSinkOptions) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSink {
            name: "http".to_string(),
            reason,
        };
        reqwest::Url::parse(&options.url).map_err(|e| invalid(format!("invalid url {:?}: {e}", options.url)))?;
        for (name, value) in &options.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("invalid header name {name:?}")))?;
            HeaderValue::from_str(value)
                .map_err(|_| invalid(format!("invalid value for header {name:?}")))?;
        }
        let timeout = Duration::from_millis(options.timeout_ms);
        let transport = HttpTransport::new(timeout).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            url: options.url,
            headers: options.headers,
            timeout,
            transport,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn emit(&self, dataset: &str, records: Vec<Value>) -> Result<(), SinkError> {
        let delivery = Delivery {
            payload: message_raw_payload(&records),
            destination: self.url.clone(),
            headers: self.headers.clone(),
            timeout: Some(self.timeout),
        };
        match self.transport.deliver(&delivery).await {
            Ok(()) => {
                debug!(dataset, url = %self.url, records = records.len(), "posted batch");
                Ok(())
            }
            Err(e) => Err(SinkError::Retryable {
                delivery: Box::new(delivery),
                reason: e.to_string(),
            }),
        }
    }
}
