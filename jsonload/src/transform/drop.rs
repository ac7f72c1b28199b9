use serde_json::Value;

use super::{path, Transform};

/// Remove the listed dot paths from every record.
pub struct DropPaths {
    paths: Vec<String>,
}

impl DropPaths {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl Transform for DropPaths {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records
            .into_iter()
            .map(|mut record| {
                for p in &self.paths {
                    path::remove(&mut record, p);
                }
                record
            })
            .collect()
    }
}
