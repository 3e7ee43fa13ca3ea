use crate::api_client::ApiClient;
use crate::config::{Config, EtlArgs, PipelineConfig, TablesArgs, TaskDefaults};
use crate::dates::parse_date;
use crate::error::Error;
use crate::object_store::LocalObjectStore;
use crate::orchestrator::{LatestCheck, TableConfig, TableContext, TableTask};
use crate::query::QueryLoader;
use crate::task::{EtlTask, RunOptions, Services, Step};
use crate::tasks;
use crate::warehouse::DryRunWarehouse;
use chrono::{Local, NaiveDate};
use log::info;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_PERIOD: i64 = 30;

fn load_config(config: &Config) -> Result<PipelineConfig, Error> {
    PipelineConfig::load(Path::new(&config.config_dir), config.overlay_name())
}

fn split_list(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// CLI flags win over task defaults, which win over today and 30 days.
pub fn resolve_options(
    args: &EtlArgs,
    defaults: &TaskDefaults,
    today: NaiveDate,
) -> Result<RunOptions, Error> {
    let date = match (args.date, &defaults.date) {
        (Some(date), _) => date,
        (None, Some(date)) => parse_date(date)?,
        (None, None) => today,
    };
    let step = match &args.step {
        Some(step) => Step::from_str(step)?,
        None => Step::Load,
    };

    Ok(RunOptions {
        task: args.task.clone(),
        sources: split_list(args.source.as_deref()),
        dest: args.dest,
        step,
        date,
        period: args.period.or(defaults.period).unwrap_or(DEFAULT_PERIOD),
        rm: args.rm || defaults.rm.unwrap_or(false),
    })
}

pub async fn run_etl(config: &Config, args: EtlArgs) -> Result<(), Error> {
    let pipeline = load_config(config)?;
    let task_config = pipeline.task(&args.task)?;
    let options = resolve_options(&args, &task_config.defaults, Local::now().date_naive())?;
    info!(
        "Running task '{}' for {} (period {} days, through {:?})",
        options.task, options.date, options.period, options.step
    );

    let services = Services {
        http: Arc::new(ApiClient::new()),
        store: Arc::new(LocalObjectStore::new(&config.store_root)),
        warehouse: Arc::new(DryRunWarehouse::new()),
        queries: QueryLoader::new(pipeline.queries.clone()),
    };
    let registry = tasks::registry(&options.task);
    let mut task = EtlTask::new(task_config.clone(), options, registry, services)?;
    task.run().await?;

    info!("Task '{}' finished.", args.task);
    Ok(())
}

/// Tables named in `filter` in config order, or every table when empty.
pub fn select_tables<'a>(tables: &'a [TableConfig], filter: &[String]) -> Result<Vec<&'a TableConfig>, Error> {
    if let Some(unknown) = filter.iter().find(|n| !tables.iter().any(|t| &t.name == *n)) {
        return Err(Error::config(format!("table '{}' is not configured", unknown)));
    }
    Ok(tables
        .iter()
        .filter(|t| filter.is_empty() || filter.contains(&t.name))
        .collect())
}

pub async fn run_tables(config: &Config, args: TablesArgs) -> Result<(), Error> {
    let pipeline = load_config(config)?;
    let today = Local::now().date_naive();
    let date = args.date.unwrap_or(today);
    let latest = match args.next_execution_date {
        Some(next) => LatestCheck::NextExecution(next),
        None => LatestCheck::RunDate,
    };

    let warehouse = DryRunWarehouse::new();
    let queries = QueryLoader::new(pipeline.queries.clone());
    let ctx = TableContext {
        warehouse: &warehouse,
        queries: &queries,
        uri_scheme: &pipeline.warehouse.uri_scheme,
        today,
    };

    let filter = split_list(args.table.as_deref());
    for table in select_tables(&pipeline.tables, &filter)? {
        let task = TableTask::new(table, date, latest, ctx);
        info!("Running {} '{}' for {}", table.kind_name(), table.name, task.run_date());
        if args.drop_schema {
            task.drop_schema().await?;
        }
        if args.create_schema {
            task.create_schema(args.check_schema).await?;
        }
        task.daily_run().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestMode;

    fn args(date: Option<NaiveDate>, step: Option<&str>) -> EtlArgs {
        EtlArgs {
            task: "revenue".to_string(),
            source: Some("bukalapak, google_search".to_string()),
            dest: DestMode::Remote,
            step: step.map(String::from),
            date,
            period: None,
            rm: false,
        }
    }

    #[test]
    fn test_resolve_options_precedence() {
        let today = NaiveDate::from_ymd_opt(2019, 9, 10).unwrap();
        let defaults = TaskDefaults {
            date: Some("2019-09-06".to_string()),
            period: Some(7),
            rm: Some(true),
        };

        let from_defaults = resolve_options(&args(None, None), &defaults, today).unwrap();
        assert_eq!(from_defaults.date, NaiveDate::from_ymd_opt(2019, 9, 6).unwrap());
        assert_eq!(from_defaults.period, 7);
        assert!(from_defaults.rm);
        assert_eq!(from_defaults.step, Step::Load);
        assert_eq!(from_defaults.sources, vec!["bukalapak", "google_search"]);

        let cli = NaiveDate::from_ymd_opt(2019, 9, 1).unwrap();
        let from_cli = resolve_options(&args(Some(cli), Some("t")), &TaskDefaults::default(), today).unwrap();
        assert_eq!(from_cli.date, cli);
        assert_eq!(from_cli.period, DEFAULT_PERIOD);
        assert!(!from_cli.rm);
        assert_eq!(from_cli.step, Step::Transform);

        let fallback = resolve_options(&args(None, None), &TaskDefaults::default(), today).unwrap();
        assert_eq!(fallback.date, today);
    }

    #[test]
    fn test_invalid_step() {
        let today = NaiveDate::from_ymd_opt(2019, 9, 10).unwrap();
        let result = resolve_options(&args(None, Some("x")), &TaskDefaults::default(), today);
        assert!(matches!(result.unwrap_err(), Error::InvalidStep { .. }));
    }

    #[test]
    fn test_select_tables() {
        let tables: Vec<TableConfig> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                toml::from_str(&format!(
                    "name = \"{0}\"\nkind = \"view\"\nquery = \"{0}\"\nparams = {{ project = \"p\", dataset = \"d\", dest = \"{0}\" }}",
                    name
                ))
                .unwrap()
            })
            .collect();

        let names = |filter: &[&str]| {
            let filter: Vec<String> = filter.iter().map(|s| s.to_string()).collect();
            select_tables(&tables, &filter)
                .map(|ts| ts.iter().map(|t| t.name.clone()).collect::<Vec<_>>())
        };
        assert_eq!(names(&[]).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(names(&["c", "a"]).unwrap(), vec!["a", "c"]);
        assert!(matches!(names(&["z"]).unwrap_err(), Error::Config { .. }));
    }
}
