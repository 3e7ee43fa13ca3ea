use super::conform;
use crate::dates::format_timestamp;
use crate::error::Error;
use crate::table::Table;
use crate::task::{Registry, SourceTransform, TransformInput};
use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::Value;
use std::sync::Arc;

pub(super) fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.insert("adjust_trackers".to_string(), Arc::new(Trackers) as Arc<dyn SourceTransform>);
    registry
}

/// Tracker tree (network, campaign, adgroup, creative) stamped with the run date.
struct Trackers;

#[async_trait]
impl SourceTransform for Trackers {
    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error> {
        let execution_date = format_timestamp(input.current_date.and_time(NaiveTime::MIN));
        let table = input.table(input.source)?;

        Ok(table
            .rows()
            .iter()
            .map(|row| {
                let mut out = conform(input.schema, row);
                out.insert(
                    "execution_date".to_string(),
                    Value::String(execution_date.clone()),
                );
                out
            })
            .collect())
    }
}
