use crate::error::Error;
use crate::table::{Record, Table};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::json::writer::JsonArray;
use datafusion::arrow::json::{ReaderBuilder, WriterBuilder};
use datafusion::prelude::{DataFrame, SessionContext};

///
/// Converts a table into a [`DataFrame`] with the given schema.
///
/// # Arguments
/// * `ctx` - The [`SessionContext`] the frame is registered with
/// * `table` - Rows to convert; columns missing from a row become null
/// * `schema` - An [`SchemaRef`] with the columns to keep and their types
///
/// # Returns
/// A Result containing either a [`DataFrame`] or an [`Error`]
pub fn to_frame(ctx: &SessionContext, table: &Table, schema: SchemaRef) -> Result<DataFrame, Error> {
    let mut decoder = ReaderBuilder::new(schema.clone())
        .with_batch_size(table.len().max(1))
        .with_coerce_primitive(true)
        .build_decoder()?;
    decoder.serialize(table.rows())?;
    let batch = match decoder.flush()? {
        Some(batch) => batch,
        None => RecordBatch::new_empty(schema),
    };

    Ok(ctx.read_batch(batch)?)
}

///
/// Collects a [`DataFrame`] back into a table, keeping nulls as explicit
/// values so every row carries every column.
pub async fn from_frame(df: DataFrame) -> Result<Table, Error> {
    let batches = df.collect().await?;
    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    let refs: Vec<&RecordBatch> = batches.iter().collect();
    writer.write_batches(&refs)?;
    writer.finish()?;
    let buf = writer.into_inner();
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Ok(Table::default());
    }
    let rows: Vec<Record> = serde_json::from_slice(&buf)?;

    Ok(Table::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::prelude::col;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("country", DataType::Utf8, true),
            Field::new("event_count", DataType::Int64, true),
            Field::new("rps", DataType::Float64, true),
        ]))
    }

    #[tokio::test]
    async fn test_round_trip_keeps_nulls() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let table = Table::new(vec![
            record(json!({"country": "TW", "event_count": 10, "rps": 0.5, "extra": true})),
            record(json!({"country": "ID", "event_count": 3})),
        ]);
        let df = to_frame(&ctx, &table, schema())?;
        let out = from_frame(df).await?;

        assert_eq!(out.len(), 2);
        assert_eq!(out.rows()[0]["rps"], json!(0.5));
        assert_eq!(out.rows()[1]["rps"], Value::Null);
        assert!(!out.has_column("extra"));
        Ok(())
    }

    #[tokio::test]
    async fn test_filter_and_empty() -> Result<(), Error> {
        let ctx = SessionContext::new();
        let table = Table::new(vec![record(json!({"country": "TW", "event_count": 1}))]);
        let df = to_frame(&ctx, &table, schema())?
            .filter(col("country").eq(datafusion::prelude::lit("ID")))?;
        assert!(from_frame(df).await?.is_empty());

        let df = to_frame(&ctx, &Table::default(), schema())?;
        assert!(from_frame(df).await?.is_empty());
        Ok(())
    }
}
