use serde_json::Value;
use tracing::warn;

use super::{path, Transform};
use crate::error::ConfigError;

const DEFAULT_KEY: &str = "addedKey";

/// Add a literal string at a dot path, from a `key=value` pair.
pub struct AddKeyValue {
    key: String,
    value: String,
}

impl AddKeyValue {
    /// Split at the first `=`. An empty key becomes `addedKey`.
    pub fn parse(pair: &str) -> Result<Self, ConfigError> {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::InvalidTransform {
                name: "addkeyvalue".to_string(),
                reason: format!("expected key=value, got {pair:?}"),
            });
        };
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        Ok(Self {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }
}

impl Transform for AddKeyValue {
    fn name(&self) -> &'static str {
        "addkeyvalue"
    }

    fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records
            .into_iter()
            .map(|mut record| {
                if path::get(&record, &self.key).is_none() {
                    let value = Value::String(self.value.clone());
                    if let Err(path::NotAnObject(at)) = path::set(&mut record, &self.key, value) {
                        warn!(key = %self.key, at = %at, "addkeyvalue path is not an object, record left unchanged");
                    }
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pair() {
        let t = AddKeyValue::parse("env=prod").unwrap();
        assert_eq!((t.key.as_str(), t.value.as_str()), ("env", "prod"));

        let t = AddKeyValue::parse("url=http://x/?a=b").unwrap();
        assert_eq!((t.key.as_str(), t.value.as_str()), ("url", "http://x/?a=b"));

        let t = AddKeyValue::parse("=v").unwrap();
        assert_eq!(t.key, "addedKey");

        let t = AddKeyValue::parse("k=").unwrap();
        assert_eq!(t.value, "");

        assert!(AddKeyValue::parse("novalue").is_err());
    }

    #[test]
    fn test_adds_nested_value_when_absent() {
        let t = AddKeyValue::parse("meta.env=prod").unwrap();
        let out = t.apply(vec![
            json!({"a": 1}),
            json!({"meta": {"env": "dev"}}),
            json!({"meta": "flat"}),
        ]);
        assert_eq!(
            out,
            vec![
                json!({"a": 1, "meta": {"env": "prod"}}),
                json!({"meta": {"env": "dev"}}),
                json!({"meta": "flat"}),
            ]
        );
    }
}
