use crate::dates::{format_date, lookback_date, lookforward_date, parse_date, EPOCH_DATE};
use crate::error::Error;
use crate::marshalling::Format;
use crate::query::{generic_cleanup, limit_zero, QueryLoader};
use crate::template::{render, Params};
use crate::warehouse::{LoadJob, QueryJob, TableRef, Warehouse, WriteMode};
use chrono::NaiveDate;
use indexmap::IndexMap;
use log::info;
use serde::Deserialize;

const DEFAULT_DAYS_BEHIND: i64 = 1;
const DEFAULT_CLEANUP_FIELD: &str = "execution_date";

fn default_load_format() -> Format {
    Format::Jsonl
}

/// Naming parameters of a warehouse entity. Every key, upstream `src*`
/// references included, is substituted into its query bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct TableParams {
    pub project: String,
    pub dataset: String,
    pub location: Option<String>,
    pub dest: String,
    #[serde(flatten)]
    pub refs: IndexMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TableKind {
    /// Loaded from the object at `params.src`.
    ObjectStoreLoad {
        #[serde(default = "default_load_format")]
        file_format: Format,
    },
    /// Materialized from a query.
    PhysicalTable {
        query: String,
        init_query: Option<String>,
        #[serde(default)]
        allow_field_addition: bool,
        #[serde(default)]
        create_view_alt: bool,
    },
    View {
        query: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: TableKind,
    pub append: Option<bool>,
    pub partition_field: Option<String>,
    #[serde(default)]
    pub backfill_days: Vec<i64>,
    pub cleanup_query: Option<String>,
    pub days_behind: Option<i64>,
    #[serde(default)]
    pub latest_only: bool,
    #[serde(default)]
    pub udf: Vec<String>,
    #[serde(default)]
    pub udf_js: Vec<String>,
    pub params: TableParams,
}

impl TableConfig {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TableKind::ObjectStoreLoad { .. } => "object-store-load",
            TableKind::PhysicalTable { .. } => "physical-table",
            TableKind::View { .. } => "view",
        }
    }
}

/// How a run decides whether it targets the newest partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestCheck {
    /// Run date not earlier than today minus the lag.
    RunDate,
    /// Scheduler-supplied next execution date plus one day, lag-adjusted,
    /// strictly later than today minus the lag.
    NextExecution(NaiveDate),
}

/// Collaborators shared by every table of one run.
#[derive(Clone, Copy)]
pub struct TableContext<'a> {
    pub warehouse: &'a dyn Warehouse,
    pub queries: &'a QueryLoader,
    /// Prefix turning `params.src` into a load URI, e.g. `gs://`.
    pub uri_scheme: &'a str,
    pub today: NaiveDate,
}

/// One warehouse entity bound to a run date.
pub struct TableTask<'a> {
    config: &'a TableConfig,
    ctx: TableContext<'a>,
    run_date: NaiveDate,
    latest: LatestCheck,
}

impl<'a> TableTask<'a> {
    /// Views run one day further behind so they only expose complete days.
    pub fn new(config: &'a TableConfig, date: NaiveDate, latest: LatestCheck, ctx: TableContext<'a>) -> Self {
        let mut task = TableTask {
            config,
            ctx,
            run_date: date,
            latest,
        };
        task.run_date = lookback_date(date, task.lag());
        task
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn lag(&self) -> i64 {
        let behind = self.config.days_behind.unwrap_or(DEFAULT_DAYS_BEHIND);
        match self.config.kind {
            TableKind::View { .. } => behind + 1,
            _ => behind,
        }
    }

    pub fn is_write_append(&self) -> bool {
        self.config.append.unwrap_or(true)
    }

    pub fn is_latest(&self) -> bool {
        let horizon = lookback_date(self.ctx.today, self.lag());
        match self.latest {
            LatestCheck::RunDate => self.run_date >= horizon,
            LatestCheck::NextExecution(next) => {
                lookback_date(lookforward_date(next, 1), self.lag()) > horizon
            }
        }
    }

    pub fn get_backfill_dates(&self) -> Vec<NaiveDate> {
        self.config
            .backfill_days
            .iter()
            .map(|days| lookback_date(self.run_date, *days))
            .collect()
    }

    fn table_ref(&self) -> TableRef {
        let p = &self.config.params;
        TableRef::new(&p.project, &p.dataset, &p.dest)
    }

    fn routine_ref(&self, id: &str) -> TableRef {
        let p = &self.config.params;
        TableRef::new(&p.project, &p.dataset, id)
    }

    fn routines(&self) -> Vec<(String, Result<String, Error>)> {
        let udf = self
            .config
            .udf
            .iter()
            .map(|name| (format!("udf_{}", name), self.ctx.queries.udf(name)));
        let udf_js = self
            .config
            .udf_js
            .iter()
            .map(|name| (format!("udf_js_{}", name), self.ctx.queries.udf_js(name)));
        udf.chain(udf_js).collect()
    }

    pub fn query_params(&self, date: NaiveDate) -> Params {
        let p = &self.config.params;
        let mut params: Params = p.refs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        params.insert("project".to_string(), p.project.clone());
        params.insert("dataset".to_string(), p.dataset.clone());
        params.insert("dest".to_string(), p.dest.clone());
        params.insert("start_date".to_string(), format_date(date));
        params.insert("end_date".to_string(), format_date(lookforward_date(date, 1)));
        params
    }

    pub async fn does_table_exist(&self) -> Result<bool, Error> {
        self.ctx.warehouse.table_exists(&self.table_ref()).await
    }

    pub async fn does_routine_exist(&self, id: &str) -> Result<bool, Error> {
        self.ctx.warehouse.routine_exists(&self.routine_ref(id)).await
    }

    /// Creates routines, then the entity itself. With `check_exists`,
    /// anything already present is left alone.
    pub async fn create_schema(&self, check_exists: bool) -> Result<(), Error> {
        let params = self.query_params(self.run_date);
        for (id, body) in self.routines() {
            if check_exists && self.does_routine_exist(&id).await? {
                continue;
            }
            self.ctx.warehouse.execute(&render(&body?, &params)?).await?;
            info!("Created routine {}", self.routine_ref(&id));
        }
        if check_exists && self.does_table_exist().await? {
            return Ok(());
        }

        match &self.config.kind {
            TableKind::ObjectStoreLoad { .. } => self.load(self.run_date, true).await,
            TableKind::PhysicalTable { query, init_query, .. } => match init_query {
                Some(init) => {
                    let sql = self.ctx.queries.render_sql(init, &params)?;
                    self.run_query(&sql).await
                }
                None => {
                    let epoch = parse_date(EPOCH_DATE)?;
                    let sql = self.ctx.queries.render_sql(query, &self.query_params(epoch))?;
                    self.run_query(&limit_zero(&sql)?).await
                }
            },
            TableKind::View { query } => {
                let sql = self.ctx.queries.render_sql(query, &params)?;
                self.ctx.warehouse.create_view(&self.table_ref(), &sql).await?;
                info!("Created view {}", self.table_ref());
                Ok(())
            }
        }
    }

    pub async fn drop_schema(&self) -> Result<(), Error> {
        for (id, _) in self.routines() {
            self.ctx.warehouse.delete_routine(&self.routine_ref(&id)).await?;
        }
        self.ctx.warehouse.delete_table(&self.table_ref()).await?;
        info!("Deleted {} '{}'", self.config.kind_name(), self.config.params.dest);
        Ok(())
    }

    /// One idempotent run for the run date, plus backfill dates for
    /// append-mode tables.
    pub async fn daily_run(&self) -> Result<(), Error> {
        let gated = !self.is_write_append() || self.config.latest_only;
        if gated && !self.is_latest() {
            info!(
                "Skipping {} for {}: not the latest run",
                self.config.name, self.run_date
            );
            return Ok(());
        }

        match &self.config.kind {
            TableKind::ObjectStoreLoad { .. } => {
                if !self.does_table_exist().await? {
                    return self.create_schema(false).await;
                }
                self.cleanup_and_load(self.run_date).await?;
                if self.is_write_append() {
                    for date in self.get_backfill_dates() {
                        self.cleanup_and_load(date).await?;
                    }
                }
                Ok(())
            }
            TableKind::PhysicalTable { create_view_alt, .. } => {
                if !self.does_table_exist().await? {
                    self.create_schema(false).await?;
                }
                self.cleanup_and_query(self.run_date).await?;
                if self.is_write_append() {
                    for date in self.get_backfill_dates() {
                        self.cleanup_and_query(date).await?;
                    }
                }
                if *create_view_alt {
                    self.replace_view_alt().await?;
                }
                Ok(())
            }
            TableKind::View { query } => {
                let sql = self
                    .ctx
                    .queries
                    .render_sql(query, &self.query_params(self.run_date))?;
                self.create_or_update_view(&self.table_ref(), &sql).await
            }
        }
    }

    async fn cleanup(&self, date: NaiveDate) -> Result<(), Error> {
        if !self.is_write_append() {
            return Ok(());
        }
        let sql = match (&self.config.cleanup_query, &self.config.kind) {
            (Some(name), _) => self.ctx.queries.render_sql(name, &self.query_params(date))?,
            (None, TableKind::PhysicalTable { .. }) => {
                let field = self
                    .config
                    .params
                    .refs
                    .get("execution_date_field")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_CLEANUP_FIELD);
                generic_cleanup(&self.table_ref().to_string(), field, &format_date(date))
            }
            (None, _) => return Ok(()),
        };
        self.ctx.warehouse.execute(&sql).await?;
        info!("Cleaned up {} for {}", self.table_ref(), date);
        Ok(())
    }

    async fn cleanup_and_load(&self, date: NaiveDate) -> Result<(), Error> {
        self.cleanup(date).await?;
        self.load(date, false).await
    }

    async fn cleanup_and_query(&self, date: NaiveDate) -> Result<(), Error> {
        self.cleanup(date).await?;
        let TableKind::PhysicalTable { query, .. } = &self.config.kind else {
            return Ok(());
        };
        let sql = self.ctx.queries.render_sql(query, &self.query_params(date))?;
        self.run_query(&sql).await
    }

    async fn run_query(&self, sql: &str) -> Result<(), Error> {
        let allow_field_addition = matches!(
            self.config.kind,
            TableKind::PhysicalTable {
                allow_field_addition: true,
                ..
            }
        );
        let job = QueryJob {
            destination: self.table_ref(),
            write: WriteMode::from_append(self.is_write_append()),
            partition_field: self.config.partition_field.clone(),
            allow_field_addition,
        };
        info!("Starting query job into {}", job.destination);
        self.ctx.warehouse.query_to_table(sql, &job).await?;
        info!("Job finished.");
        Ok(())
    }

    /// Loads the object for `date`. Schema auto-detection is only used when
    /// the load creates the table.
    async fn load(&self, date: NaiveDate, autodetect: bool) -> Result<(), Error> {
        let TableKind::ObjectStoreLoad { file_format } = &self.config.kind else {
            return Ok(());
        };
        let src = self
            .config
            .params
            .refs
            .get("src")
            .ok_or_else(|| Error::config(format!("table '{}' has no params.src", self.config.name)))?;
        let uri = format!("{}{}", self.ctx.uri_scheme, render(src, &self.query_params(date))?);
        let job = LoadJob {
            destination: self.table_ref(),
            write: WriteMode::from_append(self.is_write_append()),
            partition_field: self.config.partition_field.clone(),
            format: *file_format,
            autodetect,
            location: self.config.params.location.clone(),
        };
        info!("Starting load job {} into {}", uri, job.destination);
        let rows = self.ctx.warehouse.load_from_uri(&uri, &job).await?;
        info!("Loaded {} rows.", rows);
        Ok(())
    }

    async fn replace_view_alt(&self) -> Result<(), Error> {
        let p = &self.config.params;
        let view = TableRef::new(&p.project, &p.dataset, &format!("{}_view", p.dest));
        let sql = format!("SELECT * FROM `{}`", self.table_ref());
        self.create_or_update_view(&view, &sql).await
    }

    async fn create_or_update_view(&self, view: &TableRef, sql: &str) -> Result<(), Error> {
        if self.ctx.warehouse.table_exists(view).await? {
            self.ctx.warehouse.update_view(view, sql).await?;
            info!("Updated view {}", view);
        } else {
            self.ctx.warehouse.create_view(view, sql).await?;
            info!("Created view {}", view);
        }
        Ok(())
    }
}
