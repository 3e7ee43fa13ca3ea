//! Transform handlers of the shipped tasks, registered per source name.

mod adjust;
mod mapping;
mod revenue;
mod rps;

use crate::error::Error;
use crate::schema::TargetSchema;
use crate::table::Record;
use crate::task::Registry;
use serde_json::{Number, Value};

/// Handlers of `task`. Tasks without `load` sources have none.
pub fn registry(task: &str) -> Registry {
    match task {
        "adjust" => adjust::registry(),
        "mapping" => mapping::registry(),
        "revenue" => revenue::registry(),
        "rps" => rps::registry(),
        _ => Registry::new(),
    }
}

/// A row with exactly the schema's columns, taken from `row` where present
/// and null otherwise.
pub(crate) fn conform(schema: &TargetSchema, row: &Record) -> Record {
    let mut out = schema.empty_record();
    for (column, value) in out.iter_mut() {
        if let Some(v) = row.get(column) {
            *value = v.clone();
        }
    }
    out
}

pub(crate) fn data_check(source: &str, message: String) -> Error {
    Error::DataCheck {
        source_name: source.to_string(),
        message,
    }
}

/// Numbers and numeric strings (`"12.50"`) become floats, anything else null.
pub(crate) fn to_float(value: &Value) -> Value {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.and_then(Number::from_f64).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType};
    use serde_json::json;

    #[test]
    fn test_registry() {
        assert!(registry("adjust").contains_key("adjust_trackers"));
        assert!(registry("revenue").contains_key("bukalapak"));
        assert!(registry("revenue").contains_key("google_search"));
        assert!(registry("rps").contains_key("google_search_rps"));
        assert!(registry("mapping").contains_key("channel_installs"));
        assert!(registry("nope").is_empty());
    }

    #[test]
    fn test_conform_and_to_float() {
        let schema = TargetSchema::new(vec![
            Column::new("country", ColumnType::String),
            Column::new("payout", ColumnType::Float),
        ]);
        let row = json!({"payout": 1.5, "extra": 1}).as_object().cloned().unwrap();
        assert_eq!(
            Value::Object(conform(&schema, &row)),
            json!({"country": null, "payout": 1.5})
        );
        assert_eq!(to_float(&json!("12.50")), json!(12.5));
        assert_eq!(to_float(&json!(3)), json!(3.0));
        assert_eq!(to_float(&json!("n/a")), Value::Null);
    }
}
