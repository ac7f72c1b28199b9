use serde_json::Value;
use tracing::warn;

use super::{path, Transform};
use crate::hash::hash_bytes;

/// Write the SHA-256 of each record's JSON form at a dot path.
pub struct Checksum {
    target: String,
}

impl Checksum {
    pub fn new(target: String) -> Self {
        Self { target }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

impl Transform for Checksum {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records
            .into_iter()
            .map(|mut record| {
                if path::get(&record, &self.target).is_some_and(|v| !is_empty(v)) {
                    return record;
                }
                let serialized = serde_json::to_vec(&record).unwrap_or_default();
                let checksum = Value::String(hash_bytes(&serialized));
                if let Err(path::NotAnObject(at)) = path::set(&mut record, &self.target, checksum) {
                    warn!(target_path = %self.target, at = %at, "checksum path is not an object, record left unchanged");
                }
                record
            })
            .collect()
    }
}
