use crate::dates::{parse_date, parse_timestamp};
use crate::error::Error;
use crate::table::{Record, Table};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Semantic type of a target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Date,
}

impl ColumnType {
    /// Nulls conform to every type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ColumnType::Float, Value::Number(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Datetime, Value::String(s)) => parse_timestamp(s).is_some(),
            (ColumnType::Date, Value::String(s)) => parse_date(s).is_ok(),
            _ => false,
        }
    }

    /// Arrow type used when a table is handed to DataFusion. Temporal
    /// columns travel as text in their canonical format.
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::String | ColumnType::Datetime | ColumnType::Date => DataType::Utf8,
            ColumnType::Integer => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Column {
            name: name.to_string(),
            column_type,
        }
    }
}

/// Ordered column definitions every transformed table must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TargetSchema {
    columns: Vec<Column>,
}

impl TargetSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        TargetSchema { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type)
    }

    pub fn datetime_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Datetime)
            .map(|c| c.name.as_str())
    }

    /// A record holding every target column, all null, in schema order.
    pub fn empty_record(&self) -> Record {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), Value::Null))
            .collect()
    }

    pub fn arrow_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.column_type.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Structural check (every column present in every row) and type check
    /// (every value conforms). All failures are collected into one error.
    pub fn validate(&self, source: &str, table: &Table) -> Result<(), Error> {
        let mut errors: Vec<String> = Vec::new();
        for column in &self.columns {
            let missing = table
                .rows()
                .iter()
                .filter(|r| !r.contains_key(&column.name))
                .count();
            if missing > 0 {
                errors.push(format!(
                    "column '{}' is missing from {} of {} rows",
                    column.name,
                    missing,
                    table.len()
                ));
                continue;
            }
            for (i, row) in table.rows().iter().enumerate() {
                let value = &row[&column.name];
                if !column.column_type.accepts(value) {
                    errors.push(format!(
                        "row {} column '{}': expected {:?}, got {}",
                        i, column.name, column.column_type, value
                    ));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                source_name: source.to_string(),
                message: errors.join("\n"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revenue_schema() -> TargetSchema {
        TargetSchema::new(vec![
            Column::new("country", ColumnType::String),
            Column::new("utc_datetime", ColumnType::Datetime),
            Column::new("payout", ColumnType::Float),
            Column::new("volume", ColumnType::Integer),
        ])
    }

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_record_keeps_order() {
        let keys: Vec<String> = revenue_schema().empty_record().keys().cloned().collect();
        assert_eq!(keys, vec!["country", "utc_datetime", "payout", "volume"]);
    }

    #[test]
    fn test_arrow_schema() {
        let schema = revenue_schema().arrow_schema();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.field(1).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Int64);
    }

    #[test]
    fn test_validate_success() {
        let table = Table::new(vec![
            record(json!({"country": "TW", "utc_datetime": "2019-09-06 00:00:00", "payout": 1, "volume": 10})),
            record(json!({"country": null, "utc_datetime": null, "payout": 2.5, "volume": null})),
        ]);
        assert!(revenue_schema().validate("google_search", &table).is_ok());
    }

    #[test]
    fn test_validate_aggregates_errors() {
        let table = Table::new(vec![
            record(json!({"country": 1, "utc_datetime": "not a date", "payout": "x"})),
        ]);
        let err = revenue_schema().validate("google_search", &table).unwrap_err();
        match err {
            Error::Validation { source_name, message } => {
                assert_eq!(source_name, "google_search");
                assert!(message.contains("column 'volume' is missing"));
                assert!(message.contains("column 'country'"));
                assert!(message.contains("column 'utc_datetime'"));
                assert!(message.contains("column 'payout'"));
            }
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            schema: TargetSchema,
        }
        let w: Wrapper = toml::from_str(
            r#"
            [[schema]]
            name = "country"
            type = "string"
            [[schema]]
            name = "execution_date"
            type = "datetime"
            "#,
        )
        .unwrap();
        assert_eq!(w.schema.column_type("execution_date"), Some(ColumnType::Datetime));
        assert_eq!(w.schema.datetime_columns().collect::<Vec<_>>(), vec!["execution_date"]);
    }
}
