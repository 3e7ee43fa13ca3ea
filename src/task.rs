use crate::api_client::{resolve_api_key, HttpSource};
use crate::cache::{Mirror, RawCache, RawPayload};
use crate::config::{DestMode, TaskConfig};
use crate::dates::{format_date, lookback_date, lookforward_date, parse_timestamp};
use crate::error::Error;
use crate::jsonpath;
use crate::mapping::{self, MappingContext};
use crate::marshalling::{format_datetime_columns, serialize};
use crate::object_store::ObjectStore;
use crate::paths::{ensure_parent, PathLayout, RAW_STAGE};
use crate::query::QueryLoader;
use crate::rules;
use crate::schema::TargetSchema;
use crate::source::{ApiOrigin, ObjectStoreOrigin, Origin, Paging, SourceSpec, WarehouseQueryOrigin};
use crate::table::{Extracted, Table};
use crate::template::{render, Params};
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;
use log::{debug, info};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Last stage a run goes through. Stages before it always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Extract,
    Transform,
    Load,
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('e') => Ok(Step::Extract),
            Some('t') => Ok(Step::Transform),
            Some('l') => Ok(Step::Load),
            _ => Err(Error::InvalidStep { step: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub task: String,
    /// Sources to run; empty means every configured source.
    pub sources: Vec<String>,
    pub dest: DestMode,
    pub step: Step,
    pub date: NaiveDate,
    pub period: i64,
    pub rm: bool,
}

/// Collaborators a task talks to.
#[derive(Clone)]
pub struct Services {
    pub http: Arc<dyn HttpSource>,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub queries: QueryLoader,
}

/// What a transform handler gets to see: its own source plus the extracted
/// tables it declared as inputs.
pub struct TransformInput<'a> {
    pub source: &'a str,
    pub spec: &'a SourceSpec,
    pub schema: &'a TargetSchema,
    pub extracted: IndexMap<String, &'a Extracted>,
    /// The source's payload of the previous day, for `previous_day_base`
    /// sources that have one cached.
    pub base: Option<&'a Extracted>,
    pub current_date: NaiveDate,
    pub last_month: NaiveDate,
}

impl TransformInput<'_> {
    pub fn table(&self, name: &str) -> Result<Table, Error> {
        self.extracted
            .get(name)
            .map(|e| e.to_table())
            .ok_or_else(|| {
                Error::config(format!(
                    "source '{}' needs '{}' extracted in the same run",
                    self.source, name
                ))
            })
    }
}

#[async_trait]
pub trait SourceTransform: Send + Sync {
    /// Extracted sources handed to `transform`; just the source by default.
    fn inputs(&self, source: &str) -> Vec<String> {
        vec![source.to_string()]
    }

    /// Turns the extracted inputs into rows of the task's target schema.
    async fn transform(&self, input: &TransformInput<'_>) -> Result<Table, Error>;
}

pub type Registry = HashMap<String, Arc<dyn SourceTransform>>;

/// One run of a named task through extract, transform and load.
pub struct EtlTask {
    config: TaskConfig,
    options: RunOptions,
    handlers: IndexMap<String, Arc<dyn SourceTransform>>,
    services: Services,
    layout: PathLayout,
    last_month: NaiveDate,
    extracted: IndexMap<String, Extracted>,
    extracted_base: IndexMap<String, Extracted>,
    transformed: IndexMap<String, Table>,
}

impl EtlTask {
    /// Resolves the selected sources, their mapping modules and the
    /// transform handler of every `load` source. Nothing is fetched here.
    pub fn new(
        config: TaskConfig,
        options: RunOptions,
        mut registry: Registry,
        services: Services,
    ) -> Result<Self, Error> {
        for name in &options.sources {
            if !config.sources.contains_key(name) {
                return Err(Error::config(format!(
                    "source '{}' is not configured for task '{}'",
                    name, options.task
                )));
            }
        }

        let mut handlers = IndexMap::new();
        for (index, (name, spec)) in config.sources.iter().enumerate() {
            if !is_selected(&options, name) {
                continue;
            }
            for module in &spec.mappings {
                rules::module(module)?;
            }
            if let Some(lookup) = &spec.mapping_lookup {
                match config.sources.get_index_of(lookup) {
                    None => {
                        return Err(Error::config(format!(
                            "mapping lookup '{}' of source '{}' is not configured",
                            lookup, name
                        )))
                    }
                    Some(i) if i >= index || !is_selected(&options, lookup) => {
                        return Err(Error::config(format!(
                            "mapping lookup '{}' must be extracted before '{}'",
                            lookup, name
                        )))
                    }
                    Some(_) => {}
                }
            }
            if spec.load {
                let handler = registry.remove(name).ok_or_else(|| Error::MissingTransform {
                    task: options.task.clone(),
                    source_name: name.clone(),
                })?;
                handlers.insert(name.clone(), handler);
            }
        }

        let remote_prefix = config
            .destinations
            .object_store
            .as_ref()
            .map(|r| r.prefix.as_str())
            .unwrap_or_default();
        let layout = PathLayout::new(&options.task, &config.destinations.fs.prefix, remote_prefix);
        let last_month = lookback_date(options.date, options.period);

        Ok(EtlTask {
            config,
            options,
            handlers,
            services,
            layout,
            last_month,
            extracted: IndexMap::new(),
            extracted_base: IndexMap::new(),
            transformed: IndexMap::new(),
        })
    }

    pub fn last_month(&self) -> NaiveDate {
        self.last_month
    }

    pub fn extracted(&self) -> &IndexMap<String, Extracted> {
        &self.extracted
    }

    pub fn transformed(&self) -> &IndexMap<String, Table> {
        &self.transformed
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        if self.options.rm {
            self.remove_cached()?;
        }
        self.extract().await?;
        if self.options.step >= Step::Transform {
            self.transform().await?;
        }
        if self.options.step >= Step::Load {
            self.load().await?;
        }
        Ok(())
    }

    /// Deletes raw and staged files of every configured source.
    pub fn remove_cached(&self) -> Result<(), Error> {
        for source in self.config.sources.keys() {
            for stage in [RAW_STAGE, self.config.stage.as_str()] {
                let dir = self.layout.local_dir(stage, source);
                if dir.is_dir() {
                    std::fs::remove_dir_all(&dir)?;
                    info!("Removed {}", dir.display());
                }
            }
        }
        Ok(())
    }

    fn mirror(&self) -> Option<Mirror<'_>> {
        match (self.options.dest, &self.config.destinations.object_store) {
            (DestMode::Remote, Some(remote)) => Some(Mirror {
                store: self.services.store.as_ref(),
                bucket: remote.bucket.as_str(),
            }),
            _ => None,
        }
    }

    /// `start_date..end_date` is the look-back window of the run and
    /// `end_date..forward_date` the window of the same length after it.
    fn date_params(&self, spec: &SourceSpec) -> Params {
        let mut params = Params::new();
        params.insert(
            "start_date".to_string(),
            self.last_month.format(&spec.date_format).to_string(),
        );
        params.insert(
            "end_date".to_string(),
            self.options.date.format(&spec.date_format).to_string(),
        );
        params.insert(
            "forward_date".to_string(),
            lookforward_date(self.options.date, self.options.period)
                .format(&spec.date_format)
                .to_string(),
        );
        params.insert("date".to_string(), format_date(self.options.date));
        params
    }

    pub async fn extract(&mut self) -> Result<(), Error> {
        let sources: Vec<(String, SourceSpec)> = self
            .config
            .sources
            .iter()
            .filter(|(name, _)| is_selected(&self.options, name))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();

        for (name, spec) in sources {
            let extracted = match &spec.origin {
                Origin::Api(api) => self.extract_api(&name, &spec, api).await?,
                Origin::ObjectStore(origin) => self.extract_object_store(&name, &spec, origin).await?,
                Origin::WarehouseQuery(origin) => self.extract_query(&name, &spec, origin).await?,
                Origin::Constant(constant) => Extracted::Table(Table::new(constant.values.clone())),
            };
            let extracted = self.apply_mappings(&name, &spec, extracted)?;
            info!(
                "{} records extracted from {} source {}",
                extracted.len(),
                spec.kind_name(),
                name
            );
            if spec.previous_day_base {
                self.extract_base(&name, &spec).await?;
            }
            self.extracted.insert(name, extracted);
        }
        Ok(())
    }

    async fn extract_base(&mut self, source: &str, spec: &SourceSpec) -> Result<(), Error> {
        let yesterday = lookback_date(self.options.date, 1);
        let cache = RawCache::new(&self.layout, self.mirror());
        let base = cache.read_base(source, spec, yesterday).await?;
        match base {
            Some(base) => {
                info!("{} base records of {} from {}", base.len(), source, yesterday);
                self.extracted_base.insert(source.to_string(), base);
            }
            None => info!("No base of {} cached for {}", source, yesterday),
        }
        Ok(())
    }

    async fn extract_api(&self, source: &str, spec: &SourceSpec, api: &ApiOrigin) -> Result<Extracted, Error> {
        let mut params = self.date_params(spec);
        params.insert("api_key".to_string(), resolve_api_key(api)?);
        params.insert("page".to_string(), "1".to_string());

        let cache = RawCache::new(&self.layout, self.mirror());
        let http = self.services.http.as_ref();
        cache
            .extract(source, spec, self.options.date, || {
                fetch_api(http, source, spec, &api.url, params)
            })
            .await
    }

    async fn extract_object_store(
        &self,
        source: &str,
        spec: &SourceSpec,
        origin: &ObjectStoreOrigin,
    ) -> Result<Extracted, Error> {
        let prefix = render(&origin.path, &self.date_params(spec))?;
        let names = self.services.store.list(&origin.bucket, &prefix).await?;
        if names.is_empty() {
            info!("No objects under {}/{}", origin.bucket, prefix);
            return Ok(Extracted::empty());
        }

        let mut pages = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let relative = self
                .layout
                .raw_relative(source, self.options.date, &(i + 1).to_string(), spec.file_format);
            let path = self.layout.local(&relative);
            ensure_parent(&path)?;
            self.services.store.download(&origin.bucket, name, &path).await?;
            debug!("{}/{} downloaded to {}", origin.bucket, name, path.display());
            pages.push(std::fs::read_to_string(&path)?);
        }
        RawPayload::Pages(pages).parse(spec, source)
    }

    async fn extract_query(
        &self,
        source: &str,
        spec: &SourceSpec,
        origin: &WarehouseQueryOrigin,
    ) -> Result<Extracted, Error> {
        let mut params = self.date_params(spec);
        params.insert("project".to_string(), origin.project.clone());
        params.insert("dataset".to_string(), origin.dataset.clone());
        params.insert("table".to_string(), origin.table.clone());
        let sql = self
            .services
            .queries
            .build_query(&origin.udf, &origin.udf_js, &origin.query, &params)?;

        let cache = RawCache::new(&self.layout, self.mirror());
        let warehouse = self.services.warehouse.as_ref();
        let format = spec.file_format;
        cache
            .extract(source, spec, self.options.date, || async move {
                let rows = warehouse.query_rows(&sql).await?;
                Ok(RawPayload::Pages(vec![serialize(&rows, format)?]))
            })
            .await
    }

    fn apply_mappings(&self, source: &str, spec: &SourceSpec, extracted: Extracted) -> Result<Extracted, Error> {
        if spec.mappings.is_empty() {
            return Ok(extracted);
        }
        let modules = spec
            .mappings
            .iter()
            .map(|m| rules::module(m))
            .collect::<Result<Vec<_>, _>>()?;
        let lookup = match &spec.mapping_lookup {
            Some(name) => Some(
                self.extracted
                    .get(name)
                    .map(Extracted::to_table)
                    .ok_or_else(|| {
                        Error::config(format!(
                            "mapping lookup '{}' must be extracted before '{}'",
                            name, source
                        ))
                    })?,
            ),
            None => None,
        };
        let ctx = MappingContext {
            lookup: lookup.as_ref(),
        };
        let mapped = mapping::apply(&extracted.to_table(), &modules, &ctx)?;
        debug!("{} records of {} mapped by {:?}", mapped.len(), source, spec.mappings);
        Ok(Extracted::Table(mapped))
    }

    /// Runs every registered handler and validates its output. Validation
    /// failures of all sources are reported together.
    pub async fn transform(&mut self) -> Result<(), Error> {
        let mut transformed = IndexMap::new();
        let mut failed_sources = Vec::new();
        let mut failures = Vec::new();

        for (source, handler) in &self.handlers {
            let spec = &self.config.sources[source];
            let extracted = handler
                .inputs(source)
                .into_iter()
                .filter_map(|name| self.extracted.get(&name).map(|e| (name, e)))
                .collect();
            let input = TransformInput {
                source,
                spec,
                schema: &self.config.schema,
                extracted,
                base: self.extracted_base.get(source),
                current_date: self.options.date,
                last_month: self.last_month,
            };
            let table = handler.transform(&input).await?;
            match self.config.schema.validate(source, &table) {
                Ok(()) => {
                    info!("{} records transformed for {}", table.len(), source);
                    transformed.insert(source.clone(), table);
                }
                Err(Error::Validation { message, .. }) => {
                    failed_sources.push(source.clone());
                    failures.push(message);
                }
                Err(e) => return Err(e),
            }
        }

        if !failures.is_empty() {
            return Err(Error::Validation {
                source_name: failed_sources.join(", "),
                message: failures.join("\n"),
            });
        }
        self.transformed = transformed;
        Ok(())
    }

    /// Writes staged files, one per date of the destination `date_field`,
    /// and uploads them when the run targets remote storage. Returns the
    /// relative paths written.
    pub async fn load(&self) -> Result<Vec<String>, Error> {
        let fs_dest = &self.config.destinations.fs;
        let mut written = Vec::new();

        for (source, table) in &self.transformed {
            let mut table = table.clone();
            format_datetime_columns(&mut table, self.config.schema.datetime_columns());
            let groups = match &fs_dest.date_field {
                Some(field) => split_by_date(table, field, source)?,
                None => BTreeMap::from([(self.options.date, table)]),
            };

            for (date, rows) in groups {
                let relative = self
                    .layout
                    .staged_relative(&self.config.stage, source, date, fs_dest.file_format);
                let path = self.layout.local(&relative);
                ensure_parent(&path)?;
                std::fs::write(&path, serialize(&rows, fs_dest.file_format)?)?;
                info!("{} records loaded to {}", rows.len(), path.display());

                if let Some(mirror) = self.mirror() {
                    let remote = self.layout.remote(&relative);
                    mirror.store.upload(mirror.bucket, &remote, &path).await?;
                    info!("{} loaded to {}/{}", relative, mirror.bucket, remote);
                }
                written.push(relative);
            }
        }
        Ok(written)
    }
}

fn is_selected(options: &RunOptions, source: &str) -> bool {
    options.sources.is_empty() || options.sources.iter().any(|s| s == source)
}

fn split_by_date(table: Table, field: &str, source: &str) -> Result<BTreeMap<NaiveDate, Table>, Error> {
    let mut groups: BTreeMap<NaiveDate, Table> = BTreeMap::new();
    for (i, row) in table.into_rows().into_iter().enumerate() {
        let date = row
            .get(field)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .map(|dt| dt.date())
            .ok_or_else(|| Error::DataCheck {
                source_name: source.to_string(),
                message: format!("row {} has no valid '{}'", i, field),
            })?;
        groups.entry(date).or_default().rows_mut().push(row);
    }
    Ok(groups)
}

fn page_count(raw: &str, path: &str, source: &str) -> Result<u64, Error> {
    let doc: Value = serde_json::from_str(raw).map_err(|e| Error::Parse {
        source_name: source.to_string(),
        message: e.to_string(),
    })?;
    let count = match jsonpath::extract(&doc, path) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(1),
        _ => 1,
    };
    Ok(count.max(1))
}

async fn fetch_api(
    http: &dyn HttpSource,
    source: &str,
    spec: &SourceSpec,
    url: &str,
    mut params: Params,
) -> Result<RawPayload, Error> {
    let interval = spec.request_interval();
    match spec.paging() {
        Paging::Single => Ok(RawPayload::Pages(vec![http.get(&render(url, &params)?).await?])),
        Paging::Iterator(ids) => {
            let mut pages = IndexMap::new();
            for (i, id) in ids.into_iter().enumerate() {
                pace(i, interval).await;
                params.insert("iterator".to_string(), id.clone());
                pages.insert(id, http.get(&render(url, &params)?).await?);
            }
            info!("{} iterations extracted for {}", pages.len(), source);
            Ok(RawPayload::Iterated(pages))
        }
        Paging::PageCount { page_size, count_path } => {
            params.insert("limit".to_string(), page_size.to_string());
            let first = http.get(&render(url, &params)?).await?;
            let count = page_count(&first, &count_path, source)?;
            let mut pages = vec![first];
            for page in 2..=count {
                pace(1, interval).await;
                params.insert("page".to_string(), page.to_string());
                pages.push(http.get(&render(url, &params)?).await?);
            }
            info!("{} pages extracted for {}", pages.len(), source);
            Ok(RawPayload::Pages(pages))
        }
    }
}

/// Sleeps before every call but the first.
async fn pace(call: usize, interval: Duration) {
    if call > 0 && !interval.is_zero() {
        tokio::time::sleep(interval).await;
    }
}
