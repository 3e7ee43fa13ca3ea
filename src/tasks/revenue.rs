use super::{conform, data_check, to_float};
use crate::dates::{format_timestamp, lookforward_date, parse_timestamp};
use crate::error::Error;
use crate::frame::{from_frame, to_frame};
use crate::table::{Record, Table};
use crate::task::{Registry, SourceTransform, TransformInput};
use crate::timezone::country_offset_string;
use async_trait::async_trait;
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::common::{JoinType, ScalarValue};
use datafusion::prelude::{col, lit, SessionContext};
use indexmap::IndexMap;
use log::info;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const RPS_SOURCE: &str = "google_search_rps";

/// Partner columns, all required, and the revenue columns they land in.
/// The first eight must never be null.
const BUKALAPAK_COLUMNS: [(&str, &str); 14] = [
    ("source", "source"),
    ("Country.name", "country"),
    ("ConversionsMobile.device_os", "os"),
    ("Stat.datetime", "utc_datetime"),
    ("tz", "tz"),
    ("Stat.currency", "currency"),
    ("Stat.sale_amount", "sales_amount"),
    ("Stat.approved_payout", "payout"),
    ("Stat.affiliate_info1", "fx_defined1"),
    ("Stat.affiliate_info2", "fx_defined2"),
    ("Stat.affiliate_info3", "fx_defined3"),
    ("Stat.affiliate_info4", "fx_defined4"),
    ("Stat.affiliate_info5", "fx_defined5"),
    ("Stat.conversion_status", "conversion_status"),
];
const NOT_NULL_COLUMNS: usize = 8;

/// Columns identifying one conversion across daily extractions.
const CONVERSION_KEY: [&str; 9] = [
    "source",
    "Country.name",
    "ConversionsMobile.device_os",
    "Stat.datetime",
    "Stat.affiliate_info1",
    "Stat.affiliate_info2",
    "Stat.affiliate_info3",
    "Stat.affiliate_info4",
    "Stat.affiliate_info5",
];

pub(super) fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.insert("bukalapak".to_string(), Arc::new(Bukalapak) as Arc<dyn SourceTransform>);
    registry.insert("google_search".to_string(), Arc::new(GoogleSearch) as Arc<dyn SourceTransform>);
    registry
}

/// Offset strings per country, resolved once per distinct code.
#[derive(Default)]
struct Offsets(HashMap<String, String>);

impl Offsets {
    fn get(&mut self, country: &str) -> String {
        self.0
            .entry(country.to_string())
            .or_insert_with(|| country_offset_string(country))
            .clone()
    }
}

/// Affiliate conversions. Rows are checked (date window, required columns,
/// non-null keys), merged with the previous day's extraction when one is
/// cached, and only approved conversions are kept.
struct Bukalapak;

fn conversion_key(row: &Record) -> String {
    CONVERSION_KEY
        .iter()
        .map(|c| row.get(*c).map(Value::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

impl Bukalapak {
    fn prepare(row: &mut Record, source: &str, offsets: &mut Offsets) {
        row.insert("source".to_string(), Value::String(source.to_string()));
        let country = match row.get("Country.name").and_then(Value::as_str) {
            Some("Indonesia") => "ID",
            _ => "",
        };
        row.insert("Country.name".to_string(), Value::String(country.to_string()));
        row.insert("tz".to_string(), Value::String(offsets.get(country)));
    }

    /// Base rows updated by the current batch, followed by its new rows.
    fn merge_updates(base: Table, current: Table, source: &str) -> Table {
        let mut merged: IndexMap<String, Record> = IndexMap::new();
        for row in base.into_rows().into_iter().chain(current.into_rows()) {
            merged.insert(conversion_key(&row), row);
        }
        let latest = merged
            .values()
            .filter_map(|r| r.get("Stat.datetime").and_then(Value::as_str))
            .max()
            .unwrap_or("-")
            .to_string();
        info!("{} conversions of {} after merging the base, latest at {}", merged.len(), source, latest);
        merged.into_values().collect()
    }

    fn check_date_range(table: &Table, input: &TransformInput<'_>) -> Result<(), Error> {
        let upper = lookforward_date(input.current_date, 1);
        let outside = table
            .rows()
            .iter()
            .filter(|row| {
                match row.get("Stat.datetime").and_then(Value::as_str).and_then(parse_timestamp) {
                    Some(dt) => dt.date() < input.last_month || dt.date() > upper,
                    None => true,
                }
            })
            .count();
        if outside > 0 {
            return Err(data_check(
                input.source,
                format!(
                    "{} rows have Stat.datetime outside {} .. {}",
                    outside, input.last_month, upper
                ),
            ));
        }
        Ok(())
    }

    fn check_columns(table: &Table, source: &str) -> Result<(), Error> {
        let missing: Vec<&str> = BUKALAPAK_COLUMNS
            .iter()
            .map(|(from, _)| *from)
            .filter(|c| !table.has_column(c))
            .collect();
        if !missing.is_empty() {
            return Err(data_check(
                source,
                format!("columns [ {} ] are missing", missing.join(", ")),
            ));
        }
        Ok(())
    }

    fn check_not_null(table: &Table, source: &str) -> Result<(), Error> {
        let nulls: Vec<&str> = BUKALAPAK_COLUMNS[..NOT_NULL_COLUMNS]
            .iter()
            .map(|(from, _)| *from)
            .filter(|c| {
                table
                    .rows()
                    .iter()
                    .any(|row| matches!(row.get(*c), None | Some(Value::Null)))
            })
            .collect();
        if !nulls.is_empty() {
            return Err(data_check(
                source,
                format!("values in columns [ {} ] should not be null", nulls.join(", ")),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceTransform for Bukalapak {
    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error> {
        let mut table = input.table(input.source)?;
        if table.is_empty() {
            return Ok(table);
        }

        let mut offsets = Offsets::default();
        for row in table.rows_mut() {
            Self::prepare(row, input.source, &mut offsets);
        }
        Self::check_date_range(&table, input)?;
        Self::check_columns(&table, input.source)?;
        Self::check_not_null(&table, input.source)?;

        let table = match input.base.map(|b| b.to_table()).filter(|b| !b.is_empty()) {
            Some(mut base) => {
                for row in base.rows_mut() {
                    Self::prepare(row, input.source, &mut offsets);
                }
                Self::merge_updates(base, table, input.source)
            }
            None => table,
        };

        Ok(table
            .rows()
            .iter()
            .filter(|row| row.get("Stat.conversion_status").and_then(Value::as_str) == Some("approved"))
            .map(|row| {
                let mut renamed = Record::new();
                for (from, to) in BUKALAPAK_COLUMNS {
                    let value = row.get(from).cloned().unwrap_or(Value::Null);
                    let value = match to {
                        "sales_amount" | "payout" => to_float(&value),
                        _ => value,
                    };
                    renamed.insert(to.to_string(), value);
                }
                conform(input.schema, &renamed)
            })
            .collect())
    }
}

/// Search volume priced with the per-country revenue-per-search index.
struct GoogleSearch;

fn search_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("os", DataType::Utf8, true),
        Field::new("country_code", DataType::Utf8, true),
        Field::new("day", DataType::Utf8, true),
        Field::new("event_count", DataType::Int64, true),
    ]))
}

fn rps_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("country", DataType::Utf8, true),
        Field::new("rps", DataType::Float64, true),
    ]))
}

#[async_trait]
impl SourceTransform for GoogleSearch {
    fn inputs(&self, source: &str) -> Vec<String> {
        vec![source.to_string(), RPS_SOURCE.to_string()]
    }

    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error> {
        let ctx = SessionContext::new();
        let search_df = to_frame(&ctx, &input.table(input.source)?, search_schema())?;
        let rps_df = to_frame(&ctx, &input.table(RPS_SOURCE)?, rps_schema())?
            .select(vec![col("country").alias("rps_country"), col("rps")])?;

        let df = search_df.join(
            rps_df,
            JoinType::Left,
            &["country_code"],
            &["rps_country"],
            None,
        )?;

        // Countries missing from the index earn nothing
        let df = df.fill_null(ScalarValue::from(0.0), vec!["rps".to_owned()])?;

        let priced = df.select(vec![
            lit("google_search").alias("source"),
            col("country_code").alias("country"),
            col("os"),
            col("day").alias("utc_datetime"),
            lit("USD").alias("currency"),
            lit(0.0).alias("sales_amount"),
            (col("event_count") * col("rps")).alias("payout"),
        ])?;

        let mut offsets = Offsets::default();
        Ok(from_frame(priced)
            .await?
            .rows()
            .iter()
            .map(|row| {
                let mut out = conform(input.schema, row);
                let country = row.get("country").and_then(Value::as_str).unwrap_or_default();
                out.insert("tz".to_string(), Value::String(offsets.get(country)));
                let utc = row
                    .get("utc_datetime")
                    .and_then(Value::as_str)
                    .and_then(parse_timestamp)
                    .map(|dt| Value::String(format_timestamp(dt)))
                    .unwrap_or(Value::Null);
                out.insert("utc_datetime".to_string(), utc);
                out
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TargetSchema;
    use crate::source::SourceSpec;
    use crate::table::Extracted;
    use chrono::NaiveDate;
    use serde_json::json;

    fn revenue_schema() -> TargetSchema {
        serde_json::from_value(json!([
            {"name": "source", "type": "string"},
            {"name": "country", "type": "string"},
            {"name": "os", "type": "string"},
            {"name": "utc_datetime", "type": "datetime"},
            {"name": "tz", "type": "string"},
            {"name": "currency", "type": "string"},
            {"name": "sales_amount", "type": "float"},
            {"name": "payout", "type": "float"},
            {"name": "fx_defined1", "type": "string"},
            {"name": "fx_defined2", "type": "string"},
            {"name": "fx_defined3", "type": "string"},
            {"name": "fx_defined4", "type": "string"},
            {"name": "fx_defined5", "type": "string"},
            {"name": "conversion_status", "type": "string"}
        ]))
        .unwrap()
    }

    fn spec() -> SourceSpec {
        toml::from_str("kind = \"constant\"\nvalues = []").unwrap()
    }

    fn table(rows: Value) -> Extracted {
        Extracted::Table(
            rows.as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().cloned().unwrap())
                .collect(),
        )
    }

    fn conversion(datetime: &str, status: &str) -> Value {
        json!({
            "Country.name": "Indonesia",
            "ConversionsMobile.device_os": "Android",
            "Stat.datetime": datetime,
            "Stat.currency": "IDR",
            "Stat.sale_amount": "150000.00",
            "Stat.approved_payout": "1.25",
            "Stat.affiliate_info1": "coupon",
            "Stat.affiliate_info2": null,
            "Stat.affiliate_info3": null,
            "Stat.affiliate_info4": null,
            "Stat.affiliate_info5": null,
            "Stat.conversion_status": status
        })
    }

    async fn run(
        handler: &dyn SourceTransform,
        source: &str,
        extracted: &IndexMap<String, Extracted>,
    ) -> Result<Table, Error> {
        run_with_base(handler, source, extracted, None).await
    }

    async fn run_with_base(
        handler: &dyn SourceTransform,
        source: &str,
        extracted: &IndexMap<String, Extracted>,
        base: Option<&Extracted>,
    ) -> Result<Table, Error> {
        let spec = spec();
        let schema = revenue_schema();
        let input = TransformInput {
            source,
            spec: &spec,
            schema: &schema,
            extracted: handler
                .inputs(source)
                .into_iter()
                .filter_map(|name| extracted.get(&name).map(|e| (name, e)))
                .collect(),
            base,
            current_date: NaiveDate::from_ymd_opt(2019, 9, 6).unwrap(),
            last_month: NaiveDate::from_ymd_opt(2019, 8, 7).unwrap(),
        };
        let table = handler.transform(&input).await?;
        schema.validate(source, &table)?;
        Ok(table)
    }

    #[tokio::test]
    async fn test_bukalapak_keeps_approved() {
        let mut extracted = IndexMap::new();
        extracted.insert(
            "bukalapak".to_string(),
            table(json!([
                conversion("2019-09-05 03:00:00", "approved"),
                conversion("2019-09-05 04:00:00", "rejected")
            ])),
        );
        let out = run(&Bukalapak, "bukalapak", &extracted).await.unwrap();

        assert_eq!(out.len(), 1);
        let row = &out.rows()[0];
        assert_eq!(row["source"], json!("bukalapak"));
        assert_eq!(row["country"], json!("ID"));
        assert_eq!(row["tz"], json!("+07:00"));
        assert_eq!(row["sales_amount"], json!(150000.0));
        assert_eq!(row["payout"], json!(1.25));
        assert_eq!(row["fx_defined1"], json!("coupon"));
    }

    #[tokio::test]
    async fn test_bukalapak_merges_previous_day() {
        let mut extracted = IndexMap::new();
        extracted.insert(
            "bukalapak".to_string(),
            table(json!([
                conversion("2019-09-05 03:00:00", "approved"),
                conversion("2019-09-05 04:00:00", "approved")
            ])),
        );
        // The base is not checked against the current window.
        let base = table(json!([
            conversion("2019-08-01 10:00:00", "approved"),
            conversion("2019-09-05 03:00:00", "pending"),
            conversion("2019-09-04 09:00:00", "rejected")
        ]));
        let out = run_with_base(&Bukalapak, "bukalapak", &extracted, Some(&base))
            .await
            .unwrap();

        let datetimes: Vec<&Value> = out.column("utc_datetime");
        assert_eq!(
            datetimes,
            vec![
                &json!("2019-08-01 10:00:00"),
                &json!("2019-09-05 03:00:00"),
                &json!("2019-09-05 04:00:00")
            ]
        );
        assert!(out.rows().iter().all(|r| r["conversion_status"] == json!("approved")));
        assert!(out.rows().iter().all(|r| r["country"] == json!("ID")));

        let empty = Extracted::empty();
        let without = run_with_base(&Bukalapak, "bukalapak", &extracted, Some(&empty))
            .await
            .unwrap();
        assert_eq!(without.len(), 2);
    }

    #[tokio::test]
    async fn test_bukalapak_checks() {
        let mut extracted = IndexMap::new();
        extracted.insert(
            "bukalapak".to_string(),
            table(json!([conversion("2019-07-01 00:00:00", "approved")])),
        );
        let err = run(&Bukalapak, "bukalapak", &extracted).await.unwrap_err();
        assert!(matches!(err, Error::DataCheck { .. }));

        let mut missing = conversion("2019-09-05 03:00:00", "approved");
        missing.as_object_mut().unwrap().remove("Stat.currency");
        extracted.insert("bukalapak".to_string(), table(json!([missing])));
        match run(&Bukalapak, "bukalapak", &extracted).await.unwrap_err() {
            Error::DataCheck { message, .. } => assert!(message.contains("Stat.currency")),
            other => panic!("Expected DataCheck, got {:?}", other),
        }

        let mut null_os = conversion("2019-09-05 03:00:00", "approved");
        null_os["ConversionsMobile.device_os"] = Value::Null;
        extracted.insert("bukalapak".to_string(), table(json!([null_os])));
        match run(&Bukalapak, "bukalapak", &extracted).await.unwrap_err() {
            Error::DataCheck { message, .. } => {
                assert!(message.contains("ConversionsMobile.device_os"))
            }
            other => panic!("Expected DataCheck, got {:?}", other),
        }

        extracted.insert("bukalapak".to_string(), Extracted::empty());
        assert!(run(&Bukalapak, "bukalapak", &extracted).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_google_search_priced_by_rps() {
        let mut extracted = IndexMap::new();
        extracted.insert(
            "google_search".to_string(),
            table(json!([
                {"os": "Android", "country_code": "TW", "day": "2019-09-05", "event_count": 10},
                {"os": "Android", "country_code": "ZZ", "day": "2019-09-05", "event_count": 4}
            ])),
        );
        extracted.insert(
            RPS_SOURCE.to_string(),
            table(json!([{"country": "TW", "rps": 0.25, "volume": 100}])),
        );
        let out = run(&GoogleSearch, "google_search", &extracted).await.unwrap();

        assert_eq!(out.len(), 2);
        let tw = out.rows().iter().find(|r| r["country"] == json!("TW")).unwrap();
        assert_eq!(tw["payout"], json!(2.5));
        assert_eq!(tw["sales_amount"], json!(0.0));
        assert_eq!(tw["currency"], json!("USD"));
        assert_eq!(tw["source"], json!("google_search"));
        assert_eq!(tw["tz"], json!("+08:00"));
        assert_eq!(tw["utc_datetime"], json!("2019-09-05 00:00:00"));
        let unknown = out.rows().iter().find(|r| r["country"] == json!("ZZ")).unwrap();
        assert_eq!(unknown["payout"], json!(0.0));
    }

    #[tokio::test]
    async fn test_google_search_needs_rps() {
        let mut extracted = IndexMap::new();
        extracted.insert("google_search".to_string(), Extracted::empty());
        assert!(matches!(
            run(&GoogleSearch, "google_search", &extracted).await,
            Err(Error::Config { .. })
        ));
    }
}
