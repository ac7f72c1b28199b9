use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SourceError;

/// Files under a directory tree ending with a given extension.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
    extension: String,
}

impl FileSource {
    pub fn new(root: PathBuf, extension: &str) -> Self {
        Self {
            root,
            extension: extension.to_owned(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_readable(&self) -> Result<(), SourceError> {
        std::fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|source| SourceError::Scan {
                path: self.root.clone(),
                source,
            })
    }

    /// Every matching file under the root, sorted by path.
    pub async fn scan(&self) -> Result<Vec<PathBuf>, SourceError> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.scan_blocking())
            .await
            .map_err(|e| SourceError::Scan {
                path: self.root.clone(),
                source: io::Error::other(e),
            })?
    }

    fn scan_blocking(&self) -> Result<Vec<PathBuf>, SourceError> {
        self.ensure_readable()?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(&self.extension)
            {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub records: Vec<Value>,
    pub skipped_lines: usize,
    /// The stream ended with a decode error; `records` holds what came before it.
    pub truncated: bool,
}

/// Read a gzipped newline-delimited JSON file.
pub async fn read_records(path: &Path) -> Result<Decoded, SourceError> {
    let path = path.to_path_buf();
    let task_path = path.clone();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&task_path).map_err(|source| SourceError::Open {
            path: task_path.clone(),
            source,
        })?;
        Ok(decode(MultiGzDecoder::new(file), &task_path))
    })
    .await
    .map_err(|e| SourceError::Open {
        path,
        source: io::Error::other(e),
    })?
}

/// Decode lines of JSON. Arrays contribute each element, blank and malformed
/// lines are skipped.
pub fn decode<R: Read>(reader: R, path: &Path) -> Decoded {
    let mut decoded = Decoded::default();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut line_number = 0usize;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, records = decoded.records.len(), "error reading file, keeping records read so far");
                decoded.truncated = true;
                break;
            }
        }
        line_number += 1;

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => decoded.records.extend(items),
            Ok(value) => decoded.records.push(value),
            Err(_) => {
                debug!(path = %path.display(), line = line_number, "skipped malformed line");
                decoded.skipped_lines += 1;
            }
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn gzip(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_lines() {
        let input = b"{\"a\":1}\n\n[{\"a\":2},{\"a\":3}]\nnot json\n\"scalar\"\n{\"a\":4}";
        let decoded = decode(&input[..], Path::new("mem"));
        assert_eq!(
            decoded.records,
            vec![
                json!({"a": 1}),
                json!({"a": 2}),
                json!({"a": 3}),
                json!("scalar"),
                json!({"a": 4}),
            ]
        );
        assert_eq!(decoded.skipped_lines, 1);
        assert!(!decoded.truncated);
    }

    #[tokio::test]
    async fn test_read_gzipped_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json.gz");
        std::fs::write(&path, gzip(b"{\"a\":1}\r\n{\"a\":2}\n")).unwrap();

        let decoded = read_records(&path).await.unwrap();
        assert_eq!(decoded.records, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn test_truncated_gzip_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json.gz");
        let mut body = String::new();
        for i in 0..2000 {
            body.push_str(&format!("{{\"i\":{i}}}\n"));
        }
        let compressed = gzip(body.as_bytes());
        std::fs::write(&path, &compressed[..compressed.len() - 8]).unwrap();

        let decoded = read_records(&path).await.unwrap();
        assert!(decoded.truncated);
        assert!(!decoded.records.is_empty());
        assert_eq!(decoded.records[0], json!({"i": 0}));
    }

    #[tokio::test]
    async fn test_open_failure() {
        let dir = TempDir::new().unwrap();
        let err = read_records(&dir.path().join("missing.json.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[tokio::test]
    async fn test_scan_filters_by_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("2024/01")).unwrap();
        std::fs::write(dir.path().join("b.json.gz"), b"").unwrap();
        std::fs::write(dir.path().join("2024/01/a.json.gz"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::write(dir.path().join("c.json"), b"").unwrap();

        let source = FileSource::new(dir.path().to_path_buf(), ".json.gz");
        let files = source.scan().await.unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("2024/01/a.json.gz"),
                dir.path().join("b.json.gz"),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path().join("nope"), ".json.gz");
        assert!(source.ensure_readable().is_err());
        assert!(matches!(
            source.scan().await,
            Err(SourceError::Scan { .. })
        ));
    }
}
