use super::conform;
use crate::dates::format_timestamp;
use crate::error::Error;
use crate::table::{Record, Table};
use crate::task::{Registry, SourceTransform, TransformInput};
use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::Value;
use std::sync::Arc;

pub(super) fn registry() -> Registry {
    let mut registry = Registry::new();
    for source in ["feature_events", "channel_installs"] {
        registry.insert(source.to_string(), Arc::new(Labelled) as Arc<dyn SourceTransform>);
    }
    registry
}

/// Mapped records conformed to the label schema and stamped with the run
/// date. A record labelled with several names becomes one row per name.
struct Labelled;

fn explode(row: Record) -> Vec<Record> {
    let multi = row.iter().find_map(|(column, value)| match value {
        Value::Array(names) if column.ends_with("_name") => Some((column.clone(), names.clone())),
        _ => None,
    });
    let Some((column, names)) = multi else {
        return vec![row];
    };
    names
        .into_iter()
        .flat_map(|name| {
            let mut copy = row.clone();
            copy.insert(column.clone(), name);
            explode(copy)
        })
        .collect()
}

#[async_trait]
impl SourceTransform for Labelled {
    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error> {
        let execution_date = Value::String(format_timestamp(input.current_date.and_time(NaiveTime::MIN)));
        let table = input.table(input.source)?;

        Ok(table
            .into_rows()
            .into_iter()
            .flat_map(explode)
            .map(|row| {
                let mut out = conform(input.schema, &row);
                out.insert("execution_date".to_string(), execution_date.clone());
                out
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_explode_multi_labels() {
        let rows = explode(record(json!({
            "object": "coupon",
            "feature_type": "shopping_vertical",
            "feature_name": ["coupon_a", "coupon_b"],
            "channel_name": ["x", "y"],
        })));
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["feature_name"], json!("coupon_a"));
        assert_eq!(rows[0]["channel_name"], json!("x"));
        assert_eq!(rows[3]["feature_name"], json!("coupon_b"));
        assert_eq!(rows[3]["channel_name"], json!("y"));

        let single = explode(record(json!({"feature_name": "search", "tags": ["a", "b"]})));
        assert_eq!(single.len(), 1);
    }
}
