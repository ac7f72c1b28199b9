use serde_json::{Map, Value};

use super::{path, Transform};

/// Keep only the listed dot paths, each stored under its full dotted name.
pub struct Select {
    paths: Vec<String>,
}

impl Select {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl Transform for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    fn apply(&self, records: Vec<Value>) -> Vec<Value> {
        records
            .iter()
            .map(|record| {
                let selected: Map<String, Value> = self
                    .paths
                    .iter()
                    .filter_map(|p| path::get(record, p).map(|v| (p.clone(), v.clone())))
                    .collect();
                Value::Object(selected)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_nested_keys_by_full_name() {
        let select = Select::new(["a", "b.c", "missing"].map(String::from).to_vec());
        let out = select.apply(vec![json!({"a": 1, "b": {"c": 2, "d": 3}, "e": 4})]);
        assert_eq!(out, vec![json!({"a": 1, "b.c": 2})]);
    }

    #[test]
    fn test_select_keeps_falsy_values() {
        let select = Select::new(
            ["zero", "empty", "no", "nothing"]
                .map(String::from)
                .to_vec(),
        );
        let out = select.apply(vec![
            json!({"zero": 0, "empty": "", "no": false, "nothing": null}),
        ]);
        assert_eq!(
            out,
            vec![json!({"zero": 0, "empty": "", "no": false, "nothing": null})]
        );
    }

    #[test]
    fn test_select_on_non_object_gives_empty_record() {
        let select = Select::new(vec!["a".to_string()]);
        assert_eq!(
            select.apply(vec![json!("raw"), json!([1])]),
            vec![json!({}), json!({})]
        );
    }
}
