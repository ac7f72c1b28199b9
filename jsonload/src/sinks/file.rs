use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use super::{ndjson, Sink, SinkError};
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct FileSinkOptions {
    pub path: PathBuf,
}

/// Appends NDJSON under `path/YYYY-MM-DD/<dataset>_<HH>_<seq>.json`.
///
/// The highest sequence number of the day is reused until the file it names
/// for the current hour grows past `chunk_size`.
pub struct FileSink {
    root: PathBuf,
    chunk_size: u64,
}

impl FileSink {
    pub fn new(options: FileSinkOptions, chunk_size: u64) -> Result<Self, ConfigError> {
        if options.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidSink {
                name: "file".to_string(),
                reason: "path must not be empty".to_string(),
            });
        }
        Ok(Self {
            root: options.path,
            chunk_size,
        })
    }

    /// The file the next batch for `dataset` goes to.
    pub async fn target_file(
        &self,
        dataset: &str,
        now: DateTime<Utc>,
    ) -> std::io::Result<PathBuf> {
        let day_dir = self.root.join(now.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&day_dir).await?;

        let hour = now.format("%H").to_string();
        let Some(highest) = highest_sequence(&day_dir, dataset).await? else {
            return Ok(day_dir.join(file_name(dataset, &hour, 1)));
        };

        let candidate = day_dir.join(file_name(dataset, &hour, highest));
        let size = match tokio::fs::metadata(&candidate).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if size > self.chunk_size {
            debug!(file = %candidate.display(), size, "file is over the chunk size, rolling over");
            return Ok(day_dir.join(file_name(dataset, &hour, highest + 1)));
        }
        Ok(candidate)
    }

    pub async fn emit_at(
        &self,
        dataset: &str,
        records: &[Value],
        now: DateTime<Utc>,
    ) -> Result<PathBuf, SinkError> {
        let target = self
            .target_file(dataset, now)
            .await
            .map_err(|e| SinkError::Failed(format!("failed to prepare {}: {e}", self.root.display())))?;

        let failed = |e: std::io::Error| SinkError::Failed(format!("failed to write {}: {e}", target.display()));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await
            .map_err(failed)?;
        let data = ndjson(records);
        file.write_all(&data).await.map_err(failed)?;
        file.flush().await.map_err(failed)?;

        debug!(
            dataset,
            file = %target.display(),
            records = records.len(),
            bytes = data.len(),
            "wrote batch to file"
        );
        Ok(target)
    }
}

fn file_name(dataset: &str, hour: &str, sequence: u32) -> String {
    format!("{dataset}_{hour}_{sequence:06}.json")
}

/// Sequence number of a `<dataset>_<HH>_<NNNNNN>.json` name.
fn parse_sequence(dataset: &str, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(dataset)?.strip_prefix('_')?.strip_suffix(".json")?;
    let (hour, sequence) = rest.split_once('_')?;
    let digits = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(hour, 2) || !digits(sequence, 6) {
        return None;
    }
    sequence.parse().ok()
}

async fn highest_sequence(dir: &Path, dataset: &str) -> std::io::Result<Option<u32>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut highest = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(sequence) = name.to_str().and_then(|n| parse_sequence(dataset, n)) {
            highest = highest.max(Some(sequence));
        }
    }
    Ok(highest)
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn emit(&self, dataset: &str, records: Vec<Value>) -> Result<(), SinkError> {
        match self.emit_at(dataset, &records, Utc::now()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(dataset, error = %e, records = records.len(), "file output failed, batch lost");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn sink(dir: &TempDir, chunk_size: u64) -> FileSink {
        FileSink::new(
            FileSinkOptions {
                path: dir.path().to_path_buf(),
            },
            chunk_size,
        )
        .unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("logs", "logs_09_000042.json"), Some(42));
        assert_eq!(parse_sequence("logs", "logs_9_000042.json"), None);
        assert_eq!(parse_sequence("logs", "logs_09_42.json"), None);
        assert_eq!(parse_sequence("logs", "metrics_09_000042.json"), None);
        assert_eq!(parse_sequence("logs", "logs_09_000042.json.tmp"), None);
    }

    #[tokio::test]
    async fn test_first_file_of_the_day() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 1024);

        let path = sink.emit_at("logs", &[json!({"a": 1}), json!({"a": 2})], at(9)).await.unwrap();
        assert_eq!(path, dir.path().join("2024-03-07").join("logs_09_000001.json"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{\"a\":1}\n{\"a\":2}\n"
        );
    }

    #[tokio::test]
    async fn test_appends_until_chunk_size_then_rolls() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 10);

        let first = sink.emit_at("logs", &[json!({"a": 1})], at(9)).await.unwrap();
        let again = sink.emit_at("logs", &[json!({"a": 2})], at(9)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(std::fs::metadata(&first).unwrap().len(), 16);

        let rolled = sink.emit_at("logs", &[json!({"a": 3})], at(9)).await.unwrap();
        assert_eq!(rolled, dir.path().join("2024-03-07").join("logs_09_000002.json"));
        assert_eq!(std::fs::read_to_string(&rolled).unwrap(), "{\"a\":3}\n");
    }

    #[tokio::test]
    async fn test_new_hour_keeps_sequence_number() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 1024);

        sink.emit_at("logs", &[json!(1)], at(9)).await.unwrap();
        let next_hour = sink.emit_at("logs", &[json!(2)], at(10)).await.unwrap();
        assert_eq!(next_hour, dir.path().join("2024-03-07").join("logs_10_000001.json"));

        let other = sink.emit_at("metrics", &[json!(3)], at(10)).await.unwrap();
        assert_eq!(other, dir.path().join("2024-03-07").join("metrics_10_000001.json"));
    }

    #[tokio::test]
    async fn test_unwritable_root_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let sink = FileSink::new(FileSinkOptions { path: blocker }, 1024).unwrap();

        assert!(matches!(
            sink.emit("logs", vec![json!(1)]).await,
            Err(SinkError::Failed(_))
        ));
    }
}
