use crate::marshalling::Format;
use crate::table::Record;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

fn default_date_format() -> String {
    crate::dates::DEFAULT_DATE_FORMAT.to_string()
}

fn default_request_interval() -> f64 {
    1.0
}

fn default_staged_format() -> Format {
    Format::Jsonl
}

/// One configured data source of a task.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    #[serde(flatten)]
    pub origin: Origin,
    #[serde(default)]
    pub load: bool,
    #[serde(default)]
    pub cache_file: bool,
    #[serde(default)]
    pub force_load_cache: bool,
    #[serde(default)]
    pub file_format: Format,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default)]
    pub date_fields: Vec<String>,
    pub country_code: Option<String>,
    pub timezone: Option<String>,
    pub json_path: Option<String>,
    #[serde(default)]
    pub json_path_nested: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    pub header: Option<Vec<String>>,
    #[serde(default)]
    pub mappings: Vec<String>,
    /// Source whose extracted table is handed to the mapping rules.
    pub mapping_lookup: Option<String>,
    /// Also hand the handler the raw payload cached for the day before the
    /// run date.
    #[serde(default)]
    pub previous_day_base: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Origin {
    Api(ApiOrigin),
    ObjectStore(ObjectStoreOrigin),
    WarehouseQuery(WarehouseQueryOrigin),
    Constant(ConstantOrigin),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrigin {
    pub url: String,
    pub api_key: Option<String>,
    /// Environment variable holding the key, read at request time.
    pub api_key_env: Option<String>,
    #[serde(default = "default_request_interval")]
    pub request_interval: f64,
    pub iterator: Option<IteratorSet>,
    pub page_size: Option<u32>,
    pub json_path_page_count: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IteratorSet {
    Range { start: i64, end: i64 },
    Values(Vec<Value>),
}

impl IteratorSet {
    pub fn ids(&self) -> Vec<String> {
        match self {
            IteratorSet::Range { start, end } => (*start..*end).map(|i| i.to_string()).collect(),
            IteratorSet::Values(values) => values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreOrigin {
    pub bucket: String,
    /// Object name prefix template, e.g. `mango/staging-adjust-adjust_trackers/{start_date}`.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseQueryOrigin {
    pub project: String,
    pub dataset: String,
    #[serde(default)]
    pub table: String,
    pub query: String,
    #[serde(default)]
    pub udf: Vec<String>,
    #[serde(default)]
    pub udf_js: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstantOrigin {
    pub values: Vec<Record>,
}

pub enum Paging {
    Single,
    PageCount { page_size: u32, count_path: String },
    Iterator(Vec<String>),
}

impl SourceSpec {
    pub fn kind_name(&self) -> &'static str {
        match self.origin {
            Origin::Api(_) => "api",
            Origin::ObjectStore(_) => "object-store",
            Origin::WarehouseQuery(_) => "warehouse-query",
            Origin::Constant(_) => "constant",
        }
    }

    pub fn is_api(&self) -> bool {
        matches!(self.origin, Origin::Api(_))
    }

    pub fn paging(&self) -> Paging {
        match &self.origin {
            Origin::Api(api) => {
                if let Some(it) = &api.iterator {
                    Paging::Iterator(it.ids())
                } else if let (Some(page_size), Some(count_path)) =
                    (api.page_size, &api.json_path_page_count)
                {
                    Paging::PageCount {
                        page_size,
                        count_path: count_path.clone(),
                    }
                } else {
                    Paging::Single
                }
            }
            _ => Paging::Single,
        }
    }

    /// Iterator ids when the source is fetched over a fixed iterator set.
    pub fn iterator_ids(&self) -> Option<Vec<String>> {
        match self.paging() {
            Paging::Iterator(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn request_interval(&self) -> Duration {
        match &self.origin {
            Origin::Api(api) => Duration::from_secs_f64(api.request_interval.max(0.0)),
            _ => Duration::ZERO,
        }
    }
}

/// Where staged output is written.
#[derive(Debug, Clone, Deserialize)]
pub struct Destinations {
    pub fs: FsDestination,
    pub object_store: Option<RemoteDestination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsDestination {
    pub prefix: String,
    #[serde(default = "default_staged_format")]
    pub file_format: Format,
    /// Staged files are split by the date part of this column.
    pub date_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDestination {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_source_with_page_count() {
        let spec: SourceSpec = toml::from_str(
            r#"
            kind = "api"
            url = "https://example.com/?page={page}&limit={limit}"
            api_key_env = "PARTNER_KEY"
            page_size = 100
            json_path_page_count = "meta.pages"
            json_path = "data"
            cache_file = true
            load = true
            date_fields = ["Stat.datetime"]
            country_code = "ID"
            "#,
        )
        .unwrap();
        assert_eq!(spec.kind_name(), "api");
        assert!(spec.load && spec.cache_file && !spec.force_load_cache);
        assert_eq!(spec.file_format, Format::Json);
        assert_eq!(spec.date_format, "%Y-%m-%d");
        assert_eq!(spec.request_interval(), Duration::from_secs(1));
        match spec.paging() {
            Paging::PageCount { page_size, count_path } => {
                assert_eq!(page_size, 100);
                assert_eq!(count_path, "meta.pages");
            }
            _ => panic!("Expected page-count paging"),
        }
    }

    #[test]
    fn test_iterator_range_and_values() {
        let spec: SourceSpec = toml::from_str(
            r#"
            kind = "api"
            url = "https://example.com/?vertical={iterator}"
            iterator = { start = 1, end = 4 }
            request_interval = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(spec.iterator_ids(), Some(vec!["1".into(), "2".into(), "3".into()]));
        assert_eq!(spec.request_interval(), Duration::from_millis(500));

        let spec: SourceSpec = toml::from_str(
            r#"
            kind = "api"
            url = "https://example.com/?os={iterator}"
            iterator = ["android", "ios"]
            "#,
        )
        .unwrap();
        assert_eq!(spec.iterator_ids(), Some(vec!["android".into(), "ios".into()]));
    }

    #[test]
    fn test_constant_and_unknown_kind() {
        let spec: SourceSpec = toml::from_str(
            r#"
            kind = "constant"
            values = [{ package = 539168000 }]
            "#,
        )
        .unwrap();
        match &spec.origin {
            Origin::Constant(c) => assert_eq!(c.values.len(), 1),
            _ => panic!("Expected constant origin"),
        }
        assert!(matches!(spec.paging(), Paging::Single));

        let unknown = toml::from_str::<SourceSpec>("kind = \"ftp\"\nurl = \"x\"");
        assert!(unknown.is_err());
    }
}
