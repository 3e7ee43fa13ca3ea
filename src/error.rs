use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Unknown file format '{name}', expected one of json, jsonl, csv")]
    UnknownFormat { name: String },

    #[error("Invalid step '{step}', expected extract, transform, load or their first letter")]
    InvalidStep { step: String },

    #[error("Template parameter '{name}' is not defined")]
    MissingParameter { name: String },

    #[error("No transform registered for source '{source_name}' of task '{task}'")]
    MissingTransform { task: String, source_name: String },

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("Failed to parse payload of source '{source_name}': {message}")]
    Parse { source_name: String, message: String },

    #[error("Schema validation failed for source '{source_name}':\n{message}")]
    Validation { source_name: String, message: String },

    #[error("Conflicting classification in mapping '{mapping}' for record {record}: {existing} != {incoming}")]
    MappingConflict {
        mapping: String,
        record: usize,
        existing: String,
        incoming: String,
    },

    #[error("Data check failed for source '{source_name}': {message}")]
    DataCheck { source_name: String, message: String },

    #[error("API responded with error: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Object storage failure on '{path}': {message}")]
    ObjectStore { path: String, message: String },

    #[error("Warehouse job failed for '{target}': {message}")]
    Warehouse { target: String, message: String },

    #[error("{message}")]
    NoData { message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}
