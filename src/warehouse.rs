use crate::error::Error;
use crate::marshalling::Format;
use crate::table::Table;
use async_trait::async_trait;
use log::info;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, OnceLock};

/// Fully qualified warehouse entity (table, view or routine).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub name: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, name: &str) -> Self {
        TableRef {
            project: project.to_string(),
            dataset: dataset.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Truncate,
}

impl WriteMode {
    pub fn from_append(append: bool) -> Self {
        if append {
            WriteMode::Append
        } else {
            WriteMode::Truncate
        }
    }
}

/// Query job writing its result into `destination`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryJob {
    pub destination: TableRef,
    pub write: WriteMode,
    /// Day partitioning on this column.
    pub partition_field: Option<String>,
    pub allow_field_addition: bool,
}

/// Load job reading staged files from object storage.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    pub destination: TableRef,
    pub write: WriteMode,
    pub partition_field: Option<String>,
    pub format: Format,
    pub autodetect: bool,
    pub location: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, Error>;

    async fn routine_exists(&self, routine: &TableRef) -> Result<bool, Error>;

    /// Runs a statement (DDL, DELETE, routine creation) and waits for it.
    async fn execute(&self, sql: &str) -> Result<(), Error>;

    /// Runs a query and returns its rows.
    async fn query_rows(&self, sql: &str) -> Result<Table, Error>;

    /// Runs a query whose result is written to the job destination.
    async fn query_to_table(&self, sql: &str, job: &QueryJob) -> Result<(), Error>;

    /// Loads the objects at `uri` and returns the destination row count.
    async fn load_from_uri(&self, uri: &str, job: &LoadJob) -> Result<u64, Error>;

    async fn create_view(&self, view: &TableRef, sql: &str) -> Result<(), Error>;

    async fn update_view(&self, view: &TableRef, sql: &str) -> Result<(), Error>;

    /// Missing tables are not an error.
    async fn delete_table(&self, table: &TableRef) -> Result<(), Error>;

    /// Missing routines are not an error.
    async fn delete_routine(&self, routine: &TableRef) -> Result<(), Error>;
}

fn function_regex() -> Result<&'static Regex, Error> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = RE.get() {
        return Ok(re);
    }
    let re = Regex::new(
        r"(?i)CREATE\s+(?:OR\s+REPLACE\s+)?(?:TEMP(?:ORARY)?\s+)?FUNCTION\s+(?:IF\s+NOT\s+EXISTS\s+)?`?([\w.\-]+)`?",
    )?;
    Ok(RE.get_or_init(|| re))
}

/// Warehouse that executes nothing. Every job is logged and recorded, and
/// created tables, views and routines are tracked so existence checks
/// behave consistently within one run.
#[derive(Debug, Default)]
pub struct DryRunWarehouse {
    entities: Mutex<HashSet<String>>,
    jobs: Mutex<Vec<String>>,
}

impl DryRunWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptions of every job issued so far, in order.
    pub fn jobs(&self) -> Vec<String> {
        self.jobs.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn record(&self, job: String) {
        info!("[dry-run] {}", job);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(job);
        }
    }

    fn mark(&self, id: String, exists: bool) {
        if let Ok(mut entities) = self.entities.lock() {
            if exists {
                entities.insert(id);
            } else {
                entities.remove(&id);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.entities
            .lock()
            .map(|e| e.contains(id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Warehouse for DryRunWarehouse {
    async fn table_exists(&self, table: &TableRef) -> Result<bool, Error> {
        Ok(self.contains(&table.to_string()))
    }

    async fn routine_exists(&self, routine: &TableRef) -> Result<bool, Error> {
        Ok(self.contains(&routine.to_string()))
    }

    async fn execute(&self, sql: &str) -> Result<(), Error> {
        for cap in function_regex()?.captures_iter(sql) {
            self.mark(cap[1].to_string(), true);
        }
        self.record(format!("execute: {}", sql.trim()));
        Ok(())
    }

    async fn query_rows(&self, sql: &str) -> Result<Table, Error> {
        self.record(format!("query: {}", sql.trim()));
        Ok(Table::default())
    }

    async fn query_to_table(&self, sql: &str, job: &QueryJob) -> Result<(), Error> {
        self.mark(job.destination.to_string(), true);
        self.record(format!(
            "query into {} ({:?}, partition {:?}): {}",
            job.destination,
            job.write,
            job.partition_field,
            sql.trim()
        ));
        Ok(())
    }

    async fn load_from_uri(&self, uri: &str, job: &LoadJob) -> Result<u64, Error> {
        self.mark(job.destination.to_string(), true);
        self.record(format!(
            "load {} into {} ({:?}, {}, autodetect {})",
            uri, job.destination, job.write, job.format, job.autodetect
        ));
        Ok(0)
    }

    async fn create_view(&self, view: &TableRef, sql: &str) -> Result<(), Error> {
        if self.contains(&view.to_string()) {
            return Err(Error::Warehouse {
                target: view.to_string(),
                message: "already exists".to_string(),
            });
        }
        self.mark(view.to_string(), true);
        self.record(format!("create view {}: {}", view, sql.trim()));
        Ok(())
    }

    async fn update_view(&self, view: &TableRef, sql: &str) -> Result<(), Error> {
        if !self.contains(&view.to_string()) {
            return Err(Error::Warehouse {
                target: view.to_string(),
                message: "not found".to_string(),
            });
        }
        self.record(format!("update view {}: {}", view, sql.trim()));
        Ok(())
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), Error> {
        self.mark(table.to_string(), false);
        self.record(format!("delete table {}", table));
        Ok(())
    }

    async fn delete_routine(&self, routine: &TableRef) -> Result<(), Error> {
        self.mark(routine.to_string(), false);
        self.record(format!("delete routine {}", routine));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("taipei-bi", "mango", "mango_core")
    }

    #[tokio::test]
    async fn test_dry_run_tracks_tables_and_views() {
        let wh = DryRunWarehouse::new();
        assert!(!wh.table_exists(&table()).await.unwrap());

        let job = QueryJob {
            destination: table(),
            write: WriteMode::Append,
            partition_field: Some("submission_date".to_string()),
            allow_field_addition: true,
        };
        wh.query_to_table("SELECT 1", &job).await.unwrap();
        assert!(wh.table_exists(&table()).await.unwrap());

        let view = TableRef::new("taipei-bi", "mango", "mango_core_normalized");
        assert!(matches!(
            wh.update_view(&view, "SELECT 1").await.unwrap_err(),
            Error::Warehouse { .. }
        ));
        wh.create_view(&view, "SELECT 1").await.unwrap();
        wh.update_view(&view, "SELECT 2").await.unwrap();

        wh.delete_table(&table()).await.unwrap();
        assert!(!wh.table_exists(&table()).await.unwrap());
        assert_eq!(wh.jobs().len(), 4);
    }

    #[tokio::test]
    async fn test_dry_run_tracks_routines() {
        let wh = DryRunWarehouse::new();
        wh.execute("CREATE OR REPLACE FUNCTION `taipei-bi.mango.udf_map_channels`(x STRING) AS (x);")
            .await
            .unwrap();
        let routine = TableRef::new("taipei-bi", "mango", "udf_map_channels");
        assert!(wh.routine_exists(&routine).await.unwrap());
        wh.delete_routine(&routine).await.unwrap();
        assert!(!wh.routine_exists(&routine).await.unwrap());
    }
}
