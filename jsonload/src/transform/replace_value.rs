use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{path, Transform};
use crate::error::ConfigError;

/// Replace the value at a dot path through a lookup table.
///
/// Strings, numbers and booleans are looked up by their string form; other
/// values never match.
pub struct ReplaceValue {
    rules: Vec<(String, HashMap<String, Value>)>,
}

impl ReplaceValue {
    /// From `[{"path": {"old": "new", ...}}, ...]`, in order.
    pub fn new(config: Vec<Map<String, Value>>) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for (p, table) in config.into_iter().flatten() {
            let Value::Object(table) = table else {
                return Err(ConfigError::InvalidTransform {
                    name: "replacevalue".to_string(),
                    reason: format!("the replacements for {p:?} must be an object"),
                });
            };
            rules.push((p, table.into_iter().collect()));
        }
        Ok(Self { rules })
    }
}

fn lookup_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl Transform for ReplaceValue {
    fn name(&self) -> &'static str {
        "replacevalue"
    }

    fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records
            .into_iter()
            .map(|mut record| {
                for (p, table) in &self.rules {
                    let replacement = path::get(&record, p)
                        .and_then(lookup_key)
                        .and_then(|key| table.get(&key))
                        .cloned();
                    if let Some(replacement) = replacement {
                        // The path exists, so every intermediate is an object
                        path::set(&mut record, p, replacement).ok();
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

    fn rules(config: Value) -> ReplaceValue {
        ReplaceValue::new(serde_json::from_value(config).unwrap()).unwrap()
    }

    #[test]
    fn test_non_object_table_is_rejected() {
        let config = serde_json::from_value(json!([{"status": "ok"}])).unwrap();
        assert!(matches!(
            ReplaceValue::new(config),
            Err(ConfigError::InvalidTransform { .. })
        ));
    }

    #[test]
    fn test_replace_strings_and_nested() {
        let t = rules(json!([
            {"level": {"warn": "WARNING", "err": "ERROR"}},
            {"http.status": {"200": "ok", "500": "fail"}}
        ]));
        let out = t.apply(vec![
            json!({"level": "warn", "http": {"status": 200}}),
            json!({"level": "info", "http": {"status": "500"}}),
            json!({"other": true}),
        ]);
        assert_eq!(
            out,
            vec![
                json!({"level": "WARNING", "http": {"status": "ok"}}),
                json!({"level": "info", "http": {"status": "fail"}}),
                json!({"other": true}),
            ]
        );
    }

    #[test]
    fn test_replace_booleans_and_non_string_replacements() {
        let t = rules(json!([{"flag": {"true": 1, "false": 0}}]));
        let out = t.apply(vec![json!({"flag": true}), json!({"flag": false}), json!({"flag": null})]);
        assert_eq!(out, vec![json!({"flag": 1}), json!({"flag": 0}), json!({"flag": null})]);
    }
}
