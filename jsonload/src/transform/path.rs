//! Dot-path access into JSON records: `a.b.c` names key `c` of object `b` of object `a`.
use serde_json::{Map, Value};

#[derive(Debug, PartialEq, Eq)]
pub struct NotAnObject(pub String);

pub fn get<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |value, key| value.as_object()?.get(key))
}

/// Remove the value at `path`, if every intermediate is an object.
pub fn remove(record: &mut Value, path: &str) -> Option<Value> {
    let (parents, last) = match path.rsplit_once('.') {
        Some((parents, last)) => (Some(parents), last),
        None => (None, path),
    };
    let parent = match parents {
        Some(parents) => parents
            .split('.')
            .try_fold(record, |value, key| value.as_object_mut()?.get_mut(key))?,
        None => record,
    };
    parent.as_object_mut()?.remove(last)
}

/// Set `value` at `path`, creating missing intermediate objects.
///
/// Fails without changing the record when an existing intermediate, or the
/// record itself, is not an object.
pub fn set(record: &mut Value, path: &str, value: Value) -> Result<(), NotAnObject> {
    let keys: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = keys.split_last() else {
        return Err(NotAnObject(path.to_owned()));
    };

    let mut cursor = Some(&*record);
    for depth in 0..=parents.len() {
        match cursor {
            None => break,
            Some(Value::Object(map)) => cursor = parents.get(depth).and_then(|k| map.get(*k)),
            Some(_) => return Err(NotAnObject(parents[..depth].join("."))),
        }
    }

    let mut current = record;
    for key in parents {
        current = match current {
            Value::Object(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return Err(NotAnObject(key.to_string())),
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(NotAnObject(path.to_owned())),
    }
}
