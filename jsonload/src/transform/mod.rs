use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ConfigError;

pub mod path;

mod add_key_value;
mod checksum;
mod drop;
mod replace_value;
mod select;

pub use add_key_value::AddKeyValue;
pub use checksum::Checksum;
pub use drop::DropPaths;
pub use replace_value::ReplaceValue;
pub use select::Select;

/// A pure step over a list of records. Empty input gives empty output.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, records: Vec<Value>) -> Vec<Value>;
}

/// Resolve a transform by name. Unknown names and malformed configs are errors.
pub fn build(name: &str, config: Value) -> Result<Box<dyn Transform>, ConfigError> {
    match name {
        "select" => Ok(Box::new(Select::new(parse(name, config)?))),
        "drop" => Ok(Box::new(DropPaths::new(parse(name, config)?))),
        "checksum" => Ok(Box::new(Checksum::new(parse(name, config)?))),
        "addkeyvalue" => Ok(Box::new(AddKeyValue::parse(&parse::<String>(name, config)?)?)),
        "replacevalue" => Ok(Box::new(ReplaceValue::new(parse(name, config)?)?)),
        _ => Err(ConfigError::UnknownTransform(name.to_owned())),
    }
}

fn parse<T: DeserializeOwned>(name: &str, config: Value) -> Result<T, ConfigError> {
    serde_json::from_value(config).map_err(|e| ConfigError::InvalidTransform {
        name: name.to_owned(),
        reason: e.to_string(),
    })
}

/// The ordered transforms of one dataset.
pub struct TransformChain {
    dataset: String,
    steps: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new(dataset: &str, steps: Vec<Box<dyn Transform>>) -> Self {
        if steps.is_empty() {
            warn!(dataset, "no transforms configured, records pass through unchanged");
        }
        Self {
            dataset: dataset.to_owned(),
            steps,
        }
    }

    /// Build from `[{"name": config}, ...]`, applied in order.
    pub fn from_config(dataset: &str, steps: &[Map<String, Value>]) -> Result<Self, ConfigError> {
        let mut built = Vec::with_capacity(steps.len());
        for step in steps {
            let mut entries = step.iter();
            let (Some((name, config)), None) = (entries.next(), entries.next()) else {
                return Err(ConfigError::InvalidTransform {
                    name: format!("{step:?}"),
                    reason: "each transform must be an object with exactly one key".to_string(),
                });
            };
            built.push(build(name, config.clone())?);
        }
        Ok(Self::new(dataset, built))
    }

    pub fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        self.steps.iter().fold(records, |records, step| {
            let before = records.len();
            let out = step.apply(records);
            debug!(
                dataset = %self.dataset,
                transform = step.name(),
                before,
                after = out.len(),
                "applied transform"
            );
            out
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(config: Value) -> Result<TransformChain, ConfigError> {
        let steps: Vec<Map<String, Value>> = serde_json::from_value(config).unwrap();
        TransformChain::from_config("logs", &steps)
    }

    #[test]
    fn test_select_then_drop() {
        let chain = chain(json!([{"select": ["a"]}, {"drop": ["a"]}])).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.apply(vec![json!({"a": 1, "b": 2})]), vec![json!({})]);
    }

    #[test]
    fn test_checksum_is_stable() {
        let chain = chain(json!([{"checksum": "h"}])).unwrap();
        let first = chain.apply(vec![json!({"x": 1})]);
        let second = chain.apply(vec![json!({"x": 1})]);
        assert_eq!(first, second);

        let hash = first[0]["h"].as_str().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = chain(json!([])).unwrap();
        assert!(chain.is_empty());
        let records = vec![json!({"a": 1}), json!("raw")];
        assert_eq!(chain.apply(records.clone()), records);
    }

    #[test]
    fn test_every_transform_accepts_empty_input() {
        let chain = chain(json!([
            {"select": ["a"]},
            {"drop": ["a"]},
            {"checksum": "h"},
            {"addkeyvalue": "k=v"},
            {"replacevalue": [{"a": {"1": "one"}}]}
        ]))
        .unwrap();
        assert!(chain.apply(vec![]).is_empty());
    }

    #[test]
    fn test_unknown_transform_is_an_error() {
        assert!(matches!(
            chain(json!([{"uppercase": ["a"]}])),
            Err(ConfigError::UnknownTransform(name)) if name == "uppercase"
        ));
    }

    #[test]
    fn test_malformed_transform_config_is_an_error() {
        assert!(matches!(
            chain(json!([{"select": "a"}])),
            Err(ConfigError::InvalidTransform { .. })
        ));
        assert!(matches!(
            chain(json!([{"select": ["a"], "drop": ["b"]}])),
            Err(ConfigError::InvalidTransform { .. })
        ));
        assert!(matches!(
            chain(json!([{}])),
            Err(ConfigError::InvalidTransform { .. })
        ));
        assert!(matches!(
            chain(json!([{"replacevalue": [{"status": "ok"}]}])),
            Err(ConfigError::InvalidTransform { .. })
        ));
    }
}
