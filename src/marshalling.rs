use crate::dates::{format_timestamp, parse_timestamp};
use crate::error::Error;
use crate::jsonpath;
use crate::source::SourceSpec;
use crate::table::{Record, Table};
use crate::timezone::{country_timezone, localize_to_utc, offset_string};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

/// Serialization format of raw payloads and staged files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Format {
    #[default]
    Json,
    Jsonl,
    Csv,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Jsonl => "jsonl",
            Format::Csv => "csv",
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Format::Json),
            "jsonl" => Ok(Format::Jsonl),
            "csv" => Ok(Format::Csv),
            other => Err(Error::UnknownFormat {
                name: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Format {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Parses a raw payload of `source_name` into a table according to the
/// source's format, JSON paths and timezone settings.
pub fn parse(raw: &str, spec: &SourceSpec, source_name: &str) -> Result<Table, Error> {
    let parse_err = |message: String| Error::Parse {
        source_name: source_name.to_string(),
        message,
    };

    let mut table = match spec.file_format {
        Format::Jsonl => parse_jsonl(raw).map_err(|e| parse_err(e.to_string()))?,
        Format::Json => {
            let doc: Value = serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
            let base = match &spec.json_path {
                Some(path) => jsonpath::extract(&doc, path),
                None => Some(&doc),
            };
            match base {
                None => Table::default(),
                Some(base) if !spec.json_path_nested.is_empty() => {
                    Table::new(jsonpath::unnest(base, &spec.json_path_nested, &spec.fields))
                }
                Some(base) => Table::new(jsonpath::normalize(base)),
            }
        }
        Format::Csv => {
            parse_csv(raw, spec.header.as_deref()).map_err(|e| parse_err(e.to_string()))?
        }
    };

    if !spec.date_fields.is_empty() {
        let tz = resolve_timezone(spec)?;
        normalize_dates(&mut table, &spec.date_fields, tz.as_ref(), source_name)?;
    }
    Ok(table)
}

fn parse_jsonl(raw: &str) -> Result<Table, serde_json::Error> {
    let mut rows = Vec::new();
    for line in raw.lines() {
        if line.len() < 3 {
            continue;
        }
        match serde_json::from_str::<Value>(line)? {
            Value::Object(obj) => rows.push(obj),
            other => {
                let mut row = Record::new();
                row.insert("value".to_string(), other);
                rows.push(row);
            }
        }
    }
    Ok(Table::new(rows))
}

fn parse_csv(raw: &str, header: Option<&[String]>) -> Result<Table, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(header.is_none())
        .from_reader(raw.as_bytes());
    let names: Vec<String> = match header {
        Some(h) => h.to_vec(),
        None => reader.headers()?.iter().map(str::to_string).collect(),
    };

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let row: Record = names
            .iter()
            .zip(record.iter())
            .map(|(name, field)| (name.clone(), infer_value(field)))
            .collect();
        rows.push(row);
    }
    Ok(Table::new(rows))
}

fn infer_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = field.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(field.to_string())
}

/// An explicit IANA `timezone` wins over `country_code`.
pub fn resolve_timezone(spec: &SourceSpec) -> Result<Option<Tz>, Error> {
    if let Some(name) = &spec.timezone {
        let tz = name
            .parse::<Tz>()
            .map_err(|_| Error::config(format!("unknown timezone '{}'", name)))?;
        return Ok(Some(tz));
    }
    Ok(spec.country_code.as_deref().map(country_timezone))
}

/// Parses every date field as a timestamp. With a timezone, each row gets a
/// `tz` offset column and the fields are converted from local time to UTC.
pub fn normalize_dates(
    table: &mut Table,
    date_fields: &[String],
    tz: Option<&Tz>,
    source_name: &str,
) -> Result<(), Error> {
    let tz_str = tz.map(offset_string);
    for (i, row) in table.rows_mut().iter_mut().enumerate() {
        for field in date_fields {
            let Some(value) = row.get_mut(field) else {
                continue;
            };
            let Some(text) = value.as_str() else {
                continue;
            };
            let parsed = parse_timestamp(text).ok_or_else(|| Error::Parse {
                source_name: source_name.to_string(),
                message: format!("row {} field '{}': invalid timestamp '{}'", i, field, text),
            })?;
            let utc = match tz {
                Some(tz) => localize_to_utc(parsed, tz),
                None => parsed,
            };
            *value = Value::String(format_timestamp(utc));
        }
        if let Some(tz_str) = &tz_str {
            row.insert("tz".to_string(), Value::String(tz_str.clone()));
        }
    }
    Ok(())
}

/// Rewrites timestamp strings of `columns` into the dash-delimited form the
/// warehouse loader accepts. Unparseable values are left untouched.
pub fn format_datetime_columns<'a>(table: &mut Table, columns: impl IntoIterator<Item = &'a str>) {
    let columns: Vec<&str> = columns.into_iter().collect();
    for row in table.rows_mut() {
        for column in &columns {
            if let Some(value) = row.get_mut(*column) {
                if let Some(dt) = value.as_str().and_then(parse_timestamp) {
                    *value = Value::String(format_timestamp(dt));
                }
            }
        }
    }
}

pub fn serialize(table: &Table, format: Format) -> Result<String, Error> {
    match format {
        Format::Jsonl => {
            let mut out = String::new();
            for row in table.rows() {
                out.push_str(&serde_json::to_string(row)?);
                out.push('\n');
            }
            Ok(out)
        }
        Format::Json => {
            if table.is_empty() {
                return Ok("[]".to_string());
            }
            let rows = table
                .rows()
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("[{}\n]", rows.join(",\n")))
        }
        Format::Csv => {
            let columns = table.columns();
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(&columns)?;
            for row in table.rows() {
                writer.write_record(columns.iter().map(|c| csv_field(row.get(c))))?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?;
            String::from_utf8(bytes).map_err(|e| Error::Parse {
                source_name: "csv".to_string(),
                message: e.to_string(),
            })
        }
    }
}

fn csv_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
