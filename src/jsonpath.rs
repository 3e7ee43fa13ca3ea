use crate::naming::singular_prefix;
use crate::table::Record;
use serde_json::{Map, Value};

/// Walks a dotted path (`response.data.data`). An empty path returns the
/// value itself; any missing segment returns `None`.
pub fn extract<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

/// Flattens nested objects into dotted keys, keeping arrays and scalars as
/// leaf values: `{"Stat": {"id": 1}}` -> `{"Stat.id": 1}`.
pub fn flatten_record(value: &Map<String, Value>) -> Record {
    let mut out = Map::new();
    flatten_into(&mut out, "", value);
    out
}

fn flatten_into(out: &mut Record, prefix: &str, value: &Map<String, Value>) {
    for (key, v) in value {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match v {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, &name, inner),
            _ => {
                out.insert(name, v.clone());
            }
        }
    }
}

/// Normalizes an extracted JSON value into rows: an array of objects gives
/// one row each, a single object gives one row, scalars inside an array are
/// stored under `value`.
pub fn normalize(value: &Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => flatten_record(obj),
                other => {
                    let mut row = Map::new();
                    row.insert("value".to_string(), other.clone());
                    row
                }
            })
            .collect(),
        Value::Object(obj) => vec![flatten_record(obj)],
        Value::Null => Vec::new(),
        other => {
            let mut row = Map::new();
            row.insert("value".to_string(), other.clone());
            vec![row]
        }
    }
}

/// Recursively unnests arrays along `paths`, producing one flat row per leaf
/// combination. At each level the listed `fields` are copied with the
/// singular lower-cased name of the path segment as prefix
/// (`networks` + `name` -> `network_name`). A segment that resolves to
/// nothing drops that branch only.
pub fn unnest(value: &Value, paths: &[String], fields: &[String]) -> Vec<Record> {
    let mut rows = Vec::new();
    unnest_level(value, paths, fields, &Map::new(), &mut rows);
    rows
}

fn unnest_level(
    value: &Value,
    paths: &[String],
    fields: &[String],
    inherited: &Record,
    rows: &mut Vec<Record>,
) {
    let Some((path, rest)) = paths.split_first() else {
        rows.push(inherited.clone());
        return;
    };
    let items = match extract(value, path) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(single @ Value::Object(_)) => std::slice::from_ref(single),
        _ => return,
    };
    let prefix = singular_prefix(path);
    for item in items {
        let mut row = inherited.clone();
        for field in fields {
            let v = item.get(field).cloned().unwrap_or(Value::Null);
            row.insert(format!("{}_{}", prefix, field), v);
        }
        unnest_level(item, rest, fields, &row, rows);
    }
}
