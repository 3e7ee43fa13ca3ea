use crate::error::Error;
use crate::marshalling;
use crate::object_store::ObjectStore;
use crate::dates::DEFAULT_DATE_FORMAT;
use crate::paths::{ensure_parent, PathLayout, RAW_STAGE};
use crate::source::SourceSpec;
use crate::table::{Extracted, Table};
use chrono::NaiveDate;
use indexmap::IndexMap;
use log::{debug, info};
use std::future::Future;

/// Unparsed payload of one source fetch. Never mutated once captured.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Pages in request order, stored as pages `1..=n`.
    Pages(Vec<String>),
    /// One payload per iterator id.
    Iterated(IndexMap<String, String>),
}

impl RawPayload {
    fn entries(&self) -> Vec<(String, &str)> {
        match self {
            RawPayload::Pages(pages) => pages
                .iter()
                .enumerate()
                .map(|(i, p)| ((i + 1).to_string(), p.as_str()))
                .collect(),
            RawPayload::Iterated(map) => map.iter().map(|(k, v)| (k.clone(), v.as_str())).collect(),
        }
    }

    pub fn parse(&self, spec: &SourceSpec, source: &str) -> Result<Extracted, Error> {
        match self {
            RawPayload::Pages(pages) => {
                let mut table = Table::default();
                for page in pages {
                    table.append(marshalling::parse(page, spec, source)?);
                }
                Ok(Extracted::Table(table))
            }
            RawPayload::Iterated(map) => {
                let mut tables = IndexMap::new();
                for (id, raw) in map {
                    tables.insert(id.clone(), marshalling::parse(raw, spec, source)?);
                }
                Ok(Extracted::Iterated(tables))
            }
        }
    }
}

/// Remote bucket raw payloads are mirrored to.
#[derive(Clone, Copy)]
pub struct Mirror<'a> {
    pub store: &'a dyn ObjectStore,
    pub bucket: &'a str,
}

/// Filesystem cache of raw payloads, optionally mirrored to object storage.
/// `mirror` is `None` when the run writes to the filesystem only.
pub struct RawCache<'a> {
    layout: &'a PathLayout,
    mirror: Option<Mirror<'a>>,
}

impl<'a> RawCache<'a> {
    pub fn new(layout: &'a PathLayout, mirror: Option<Mirror<'a>>) -> Self {
        RawCache { layout, mirror }
    }

    /// A source is cached when its first page (or first iterator id) exists
    /// for `date`.
    pub fn is_cached(&self, source: &str, spec: &SourceSpec, date: NaiveDate) -> bool {
        let first = spec
            .iterator_ids()
            .and_then(|ids| ids.into_iter().next())
            .unwrap_or_else(|| "1".to_string());
        self.layout
            .local(&self.layout.raw_relative(source, date, &first, spec.file_format))
            .is_file()
    }

    /// Reads every cached page of `source` for `date`.
    pub fn read(&self, source: &str, spec: &SourceSpec, date: NaiveDate) -> Result<RawPayload, Error> {
        let pages = self.layout.cached_pages(source, date, spec.file_format)?;
        if spec.iterator_ids().is_some() {
            let mut map = IndexMap::new();
            for (page, path) in pages {
                map.insert(page, std::fs::read_to_string(path)?);
            }
            Ok(RawPayload::Iterated(map))
        } else {
            let mut raw = Vec::with_capacity(pages.len());
            for (_, path) in pages {
                raw.push(std::fs::read_to_string(path)?);
            }
            Ok(RawPayload::Pages(raw))
        }
    }

    /// Payload an earlier run cached for `date`, read locally or, when the
    /// local cache lacks it, downloaded from the mirror first. `None` when
    /// neither holds it.
    pub async fn read_base(
        &self,
        source: &str,
        spec: &SourceSpec,
        date: NaiveDate,
    ) -> Result<Option<Extracted>, Error> {
        if !self.is_cached(source, spec, date) {
            let Some(mirror) = self.mirror else {
                return Ok(None);
            };
            let prefix = self.layout.remote(&format!(
                "{}/{}.",
                self.layout.source_dir(RAW_STAGE, source),
                date.format(DEFAULT_DATE_FORMAT)
            ));
            let names = mirror.store.list(mirror.bucket, &prefix).await?;
            if names.is_empty() {
                return Ok(None);
            }
            let remote_prefix = self.layout.remote("");
            for name in &names {
                let relative = name.strip_prefix(remote_prefix.as_str()).unwrap_or(name);
                let path = self.layout.local(relative);
                ensure_parent(&path)?;
                mirror.store.download(mirror.bucket, name, &path).await?;
            }
            debug!("{} raw files of {} restored from {}", names.len(), source, mirror.bucket);
        }
        self.read(source, spec, date)?.parse(spec, source).map(Some)
    }

    /// Writes every page to the filesystem cache and returns the relative
    /// paths written.
    pub fn persist(
        &self,
        source: &str,
        spec: &SourceSpec,
        date: NaiveDate,
        raw: &RawPayload,
    ) -> Result<Vec<String>, Error> {
        let mut written = Vec::new();
        for (page, body) in raw.entries() {
            let relative = self.layout.raw_relative(source, date, &page, spec.file_format);
            let path = self.layout.local(&relative);
            ensure_parent(&path)?;
            std::fs::write(&path, body)?;
            written.push(relative);
        }
        debug!("{} raw files written for {}", written.len(), source);
        Ok(written)
    }

    async fn upload(&self, mirror: Mirror<'_>, relative: &[String]) -> Result<(), Error> {
        for rel in relative {
            let remote = self.layout.remote(rel);
            mirror
                .store
                .upload(mirror.bucket, &remote, &self.layout.local(rel))
                .await?;
            info!("{} loaded to {}/{}", rel, mirror.bucket, remote);
        }
        Ok(())
    }

    /// Runs `fetch` unless a cached payload can be used instead.
    ///
    /// With `cache_file` set, a cache hit parses the cached pages and skips
    /// the fetch. A miss fetches, persists the payload and, for API sources
    /// when a mirror is configured, uploads it as a backup. Without
    /// `cache_file`, fetched API payloads are still mirrored when
    /// `force_load_cache` is set.
    pub async fn extract<F, Fut>(
        &self,
        source: &str,
        spec: &SourceSpec,
        date: NaiveDate,
        fetch: F,
    ) -> Result<Extracted, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawPayload, Error>>,
    {
        let dir = self.layout.source_dir(RAW_STAGE, source);
        if spec.cache_file {
            if self.is_cached(source, spec, date) {
                let raw = self.read(source, spec, date)?;
                info!(
                    "Cache hit for {}/{} x {} pages",
                    dir,
                    date,
                    raw.entries().len()
                );
                return raw.parse(spec, source);
            }
            info!("Cache miss for {}/{}", dir, date);
            let raw = fetch().await?;
            let extracted = raw.parse(spec, source)?;
            let written = self.persist(source, spec, date, &raw)?;
            if let Some(mirror) = self.mirror.filter(|_| spec.is_api()) {
                self.upload(mirror, &written).await?;
            }
            Ok(extracted)
        } else {
            let raw = fetch().await?;
            let extracted = raw.parse(spec, source)?;
            if let Some(mirror) = self.mirror.filter(|_| spec.is_api() && spec.force_load_cache) {
                let written = self.persist(source, spec, date, &raw)?;
                self.upload(mirror, &written).await?;
            }
            Ok(extracted)
        }
    }
}
