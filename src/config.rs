use crate::error::Error;
use crate::orchestrator::TableConfig;
use crate::query::QueryDirs;
use crate::schema::TargetSchema;
use crate::source::{Destinations, SourceSpec};
use chrono::NaiveDate;
use clap::{Args as ClapArgs, ValueEnum};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_DIR: &str = "configs";
const DEFAULT_STORE_ROOT: &str = "./object-store";
const BASE_CONFIG: &str = "pipeline.toml";
const DEBUG_OVERLAY: &str = "debug";

#[derive(ClapArgs)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_CONFIG_DIR, env = "PIPELINE_CONFIG_DIR", global = true)]
    pub config_dir: String,

    /// Environment overlay merged over pipeline.toml, e.g. `staging`.
    #[arg(long = "config", global = true)]
    pub overlay: Option<String>,

    #[arg(long, global = true)]
    pub debug: bool,

    /// Root directory of the local object store, one subdirectory per bucket.
    #[arg(long, default_value = DEFAULT_STORE_ROOT, env = "PIPELINE_STORE_ROOT", global = true)]
    pub store_root: String,
}

impl Config {
    /// `--config` wins; `--debug` alone selects the debug overlay.
    pub fn overlay_name(&self) -> Option<&str> {
        match &self.overlay {
            Some(name) => Some(name.as_str()),
            None if self.debug => Some(DEBUG_OVERLAY),
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DestMode {
    /// Local filesystem only.
    #[default]
    Fs,
    /// Filesystem plus object storage.
    Remote,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct EtlArgs {
    #[arg(long)]
    pub task: String,

    /// Comma-separated source names; all sources when absent.
    #[arg(long)]
    pub source: Option<String>,

    #[arg(long, value_enum, default_value_t = DestMode::Fs)]
    pub dest: DestMode,

    /// Last stage to run: extract, transform, load or their first letter.
    #[arg(long)]
    pub step: Option<String>,

    #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
    pub date: Option<NaiveDate>,

    /// Look-back window in days.
    #[arg(long)]
    pub period: Option<i64>,

    /// Remove cached raw and staged files before running.
    #[arg(long)]
    pub rm: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TablesArgs {
    /// Comma-separated table names; all tables when absent.
    #[arg(long)]
    pub table: Option<String>,

    #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
    pub date: Option<NaiveDate>,

    /// Next execution date supplied by an external scheduler.
    #[arg(long, value_parser = validate_date)]
    pub next_execution_date: Option<NaiveDate>,

    #[arg(long)]
    pub create_schema: bool,

    /// With --create-schema, skip entities that already exist.
    #[arg(long)]
    pub check_schema: bool,

    #[arg(long)]
    pub drop_schema: bool,
}

pub fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

fn default_uri_scheme() -> String {
    "gs://".to_string()
}

fn default_stage() -> String {
    "staging".to_string()
}

/// Warehouse settings every table inherits unless it sets its own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseDefaults {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub dataset: String,
    pub location: Option<String>,
    /// Prefix of object URIs handed to load jobs.
    #[serde(default = "default_uri_scheme")]
    pub uri_scheme: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDefaults {
    pub date: Option<String>,
    pub period: Option<i64>,
    pub rm: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub defaults: TaskDefaults,
    pub sources: IndexMap<String, SourceSpec>,
    pub schema: TargetSchema,
    pub destinations: Destinations,
}

/// Fully resolved pipeline configuration. Built once per run and never
/// mutated afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub warehouse: WarehouseDefaults,
    #[serde(default)]
    pub queries: QueryDirs,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskConfig>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl PipelineConfig {
    /// Reads `pipeline.toml` from `dir`, deep-merges `<overlay>.toml` over
    /// it, fills table params from `[warehouse]`, then deserializes.
    pub fn load(dir: &Path, overlay: Option<&str>) -> Result<Self, Error> {
        let mut doc = read_toml(&dir.join(BASE_CONFIG))?;
        if let Some(name) = overlay {
            let overlay_doc = read_toml(&dir.join(format!("{}.toml", name)))?;
            merge(&mut doc, overlay_doc);
        }
        Self::from_value(doc, dir)
    }

    pub fn from_value(mut doc: toml::Value, base_dir: &Path) -> Result<Self, Error> {
        inherit_warehouse_params(&mut doc);
        let mut config: PipelineConfig = doc.try_into()?;
        config.queries = config.queries.rooted_at(base_dir);
        Ok(config)
    }

    pub fn task(&self, name: &str) -> Result<&TaskConfig, Error> {
        self.tasks
            .get(name)
            .ok_or_else(|| Error::config(format!("task '{}' is not configured", name)))
    }
}

fn read_toml(path: &PathBuf) -> Result<toml::Value, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read '{}': {}", path.display(), e)))?;
    Ok(toml::from_str(&text)?)
}

/// Tables merge key by key; any other overlay value replaces the base one.
pub fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn inherit_warehouse_params(doc: &mut toml::Value) {
    let Some(root) = doc.as_table_mut() else {
        return;
    };
    let inherited: Vec<(String, toml::Value)> = match root.get("warehouse").and_then(|w| w.as_table()) {
        Some(warehouse) => ["project", "dataset", "location"]
            .iter()
            .filter_map(|k| warehouse.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect(),
        None => return,
    };
    let Some(tables) = root.get_mut("tables").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for table in tables.iter_mut().filter_map(|t| t.as_table_mut()) {
        let params = table
            .entry("params")
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        if let Some(params) = params.as_table_mut() {
            for (key, value) in &inherited {
                params.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::TableKind;
    use crate::query::QueryLoader;
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = r#"
        [warehouse]
        project = "taipei-bi"
        dataset = "mango_prod"
        location = "US"

        [tasks.adjust]
        defaults = { rm = true }

        [tasks.adjust.sources.adjust_trackers]
        kind = "api"
        url = "https://api.example.com/kpis?end_date={end_date}&user_token={api_key}"
        api_key_env = "ADJUST_API_KEY"
        json_path_nested = ["result_set.networks", "campaigns"]
        fields = ["name", "token"]
        cache_file = true
        load = true

        [[tasks.adjust.schema]]
        name = "network_name"
        type = "string"

        [tasks.adjust.destinations.fs]
        prefix = "./data/"
        date_field = "execution_date"

        [tasks.adjust.destinations.object_store]
        bucket = "moz-taipei-bi"
        prefix = "mango/"

        [[tables]]
        name = "mango_core"
        kind = "physical-table"
        query = "mango_core"
        partition_field = "submission_date"
        params = { src = "telemetry.core", dest = "mango_core" }

        [[tables]]
        name = "mango_core_normalized"
        kind = "view"
        query = "mango_core_normalized"
        params = { src = "mango_core", dest = "mango_core_normalized", dataset = "mango_views" }
    "#;

    #[test]
    fn test_validate_date() {
        assert_eq!(
            validate_date("2019-09-06"),
            Ok(NaiveDate::from_ymd_opt(2019, 9, 6).unwrap())
        );
        assert!(validate_date("2019-13-01").is_err());
        assert!(validate_date("2019/09/06").is_err());
    }

    #[test]
    fn test_overlay_name() {
        let config = Config {
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            overlay: None,
            debug: true,
            store_root: DEFAULT_STORE_ROOT.to_string(),
        };
        assert_eq!(config.overlay_name(), Some("debug"));
        let config = Config {
            overlay: Some("staging".to_string()),
            ..config
        };
        assert_eq!(config.overlay_name(), Some("staging"));
    }

    #[test]
    fn test_load_inherits_warehouse_params() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(BASE_CONFIG), BASE).unwrap();
        let config = PipelineConfig::load(tmp.path(), None).unwrap();

        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.tables[0].params.project, "taipei-bi");
        assert_eq!(config.tables[0].params.dataset, "mango_prod");
        assert_eq!(config.tables[0].params.location.as_deref(), Some("US"));
        assert_eq!(config.tables[1].params.dataset, "mango_views");
        assert!(matches!(config.tables[1].kind, TableKind::View { .. }));
        assert_eq!(config.queries.sql, tmp.path().join("sql"));

        let task = config.task("adjust").unwrap();
        assert_eq!(task.stage, "staging");
        assert_eq!(task.defaults.rm, Some(true));
        assert!(task.sources["adjust_trackers"].load);
        assert!(matches!(config.task("rps"), Err(Error::Config { .. })));
    }

    #[test]
    fn test_overlay_deep_merges() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(BASE_CONFIG), BASE).unwrap();
        fs::write(
            tmp.path().join("debug.toml"),
            r#"
            [warehouse]
            dataset = "mango_dev"

            [tasks.adjust.destinations.fs]
            prefix = "./debug-data/"
            "#,
        )
        .unwrap();
        let config = PipelineConfig::load(tmp.path(), Some("debug")).unwrap();

        assert_eq!(config.warehouse.project, "taipei-bi");
        assert_eq!(config.tables[0].params.dataset, "mango_dev");
        let fs_dest = &config.task("adjust").unwrap().destinations.fs;
        assert_eq!(fs_dest.prefix, "./debug-data/");
        assert_eq!(fs_dest.date_field.as_deref(), Some("execution_date"));
    }

    #[test]
    fn test_shipped_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_DIR);
        for overlay in [None, Some("debug"), Some("staging")] {
            let config = PipelineConfig::load(&dir, overlay).unwrap();
            for (name, task) in &config.tasks {
                let handlers = crate::tasks::registry(name);
                for (source, spec) in &task.sources {
                    assert_eq!(spec.load, handlers.contains_key(source), "{}.{}", name, source);
                }
            }
            for table in &config.tables {
                assert!(!table.params.project.is_empty(), "{}", table.name);
                for udf in &table.udf {
                    QueryLoader::new(config.queries.clone()).udf(udf).unwrap();
                }
            }
        }

        let debug = PipelineConfig::load(&dir, Some("debug")).unwrap();
        assert_eq!(debug.tables[0].params.dataset, "mango_dev");
        assert_eq!(debug.task("revenue").unwrap().defaults.period, Some(3));
    }

    #[test]
    fn test_missing_overlay() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(BASE_CONFIG), BASE).unwrap();
        assert!(matches!(
            PipelineConfig::load(tmp.path(), Some("prod")),
            Err(Error::Config { .. })
        ));
    }
}
