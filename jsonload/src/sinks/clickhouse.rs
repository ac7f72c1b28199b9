use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use super::{ndjson, Sink, SinkError};
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub insert_query: String,
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_user() -> String {
    "default".to_string()
}

fn default_binary() -> String {
    "clickhouse".to_string()
}

/// Pipes each batch as NDJSON into `clickhouse client --query <insert_query>`.
pub struct ClickHouseSink {
    options: ClickHouseOptions,
}

impl ClickHouseSink {
    pub fn new(options: ClickHouseOptions) -> Result<Self, ConfigError> {
        if options.insert_query.trim().is_empty() {
            return Err(ConfigError::InvalidSink {
                name: "clickhouse".to_string(),
                reason: "insert_query must not be empty".to_string(),
            });
        }
        Ok(Self { options })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.options.binary);
        command
            .arg("client")
            .arg("--host")
            .arg(&self.options.host)
            .arg("--port")
            .arg(self.options.port.to_string())
            .arg("--user")
            .arg(&self.options.user)
            .arg("--password")
            .arg(&self.options.password)
            .arg("--query")
            .arg(&self.options.insert_query)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn insert(&self, records: &[Value]) -> Result<(), SinkError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| SinkError::Failed(format!("failed to start {}: {e}", self.options.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&ndjson(records))
                .await
                .map_err(|e| SinkError::Failed(format!("failed to write to {}: {e}", self.options.binary)))?;
            // Closing stdin ends the insert
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SinkError::Failed(format!("failed to wait for {}: {e}", self.options.binary)))?;
        if !output.status.success() {
            return Err(SinkError::Failed(format!(
                "{} exited with {}: {}",
                self.options.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for ClickHouseSink {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    async fn emit(&self, dataset: &str, records: Vec<Value>) -> Result<(), SinkError> {
        debug!(dataset, records = records.len(), host = %self.options.host, "inserting batch into clickhouse");
        if let Err(e) = self.insert(&records).await {
            error!(dataset, error = %e, records = records.len(), "clickhouse insert failed, batch lost");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(binary: &str) -> ClickHouseOptions {
        serde_json::from_value(json!({
            "insert_query": "INSERT INTO logs FORMAT JSONEachRow",
            "binary": binary,
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = options("clickhouse");
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 9000);
        assert_eq!(options.user, "default");
        assert_eq!(options.password, "");
    }

    #[test]
    fn test_empty_query_is_rejected() {
        let mut options = options("clickhouse");
        options.insert_query = " ".to_string();
        assert!(ClickHouseSink::new(options).is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let sink = ClickHouseSink::new(options("/nonexistent/clickhouse")).unwrap();
        assert!(matches!(
            sink.emit("logs", vec![json!({"a": 1})]).await,
            Err(SinkError::Failed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipes_records_to_client() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-clickhouse");
        let args = dir.path().join("args");
        let stdin = dir.path().join("stdin");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\ncat > '{}'\n",
                args.display(),
                stdin.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let sink = ClickHouseSink::new(options(script.to_str().unwrap())).unwrap();
        sink.emit("logs", vec![json!({"a": 1}), json!({"b": 2})])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&stdin).unwrap(), "{\"a\":1}\n{\"b\":2}\n");
        let args = std::fs::read_to_string(&args).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(
            args,
            vec![
                "client",
                "--host",
                "localhost",
                "--port",
                "9000",
                "--user",
                "default",
                "--password",
                "",
                "--query",
                "INSERT INTO logs FORMAT JSONEachRow",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let sink = ClickHouseSink::new(options("false")).unwrap();
        assert!(matches!(
            sink.emit("logs", vec![json!({"a": 1})]).await,
            Err(SinkError::Failed(_))
        ));
    }
}
