use crate::error::Error;
use crate::template::{render, Params};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn default_sql_dir() -> PathBuf {
    PathBuf::from("sql")
}

fn default_udf_dir() -> PathBuf {
    PathBuf::from("udf")
}

fn default_udf_js_dir() -> PathBuf {
    PathBuf::from("udf_js")
}

/// Directories holding named query bodies (`sql/<name>.sql`) and routine
/// bodies (`udf/<name>.sql`, `udf_js/<name>.sql`).
#[derive(Debug, Clone, Deserialize)]
pub struct QueryDirs {
    #[serde(default = "default_sql_dir")]
    pub sql: PathBuf,
    #[serde(default = "default_udf_dir")]
    pub udf: PathBuf,
    #[serde(default = "default_udf_js_dir")]
    pub udf_js: PathBuf,
}

impl Default for QueryDirs {
    fn default() -> Self {
        QueryDirs {
            sql: default_sql_dir(),
            udf: default_udf_dir(),
            udf_js: default_udf_js_dir(),
        }
    }
}

impl QueryDirs {
    /// Resolves relative directories against `base`.
    pub fn rooted_at(&self, base: &Path) -> Self {
        QueryDirs {
            sql: base.join(&self.sql),
            udf: base.join(&self.udf),
            udf_js: base.join(&self.udf_js),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryLoader {
    dirs: QueryDirs,
}

impl QueryLoader {
    pub fn new(dirs: QueryDirs) -> Self {
        QueryLoader { dirs }
    }

    fn read(dir: &Path, name: &str) -> Result<String, Error> {
        let path = dir.join(format!("{}.sql", name));
        std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("cannot read query '{}': {}", path.display(), e)))
    }

    pub fn sql(&self, name: &str) -> Result<String, Error> {
        Self::read(&self.dirs.sql, name)
    }

    pub fn udf(&self, name: &str) -> Result<String, Error> {
        Self::read(&self.dirs.udf, name)
    }

    pub fn udf_js(&self, name: &str) -> Result<String, Error> {
        Self::read(&self.dirs.udf_js, name)
    }

    pub fn render_sql(&self, name: &str, params: &Params) -> Result<String, Error> {
        render(&self.sql(name)?, params)
    }

    /// Routine bodies first (SQL, then JavaScript), then the main query,
    /// each rendered with `params`.
    pub fn build_query(
        &self,
        udf: &[String],
        udf_js: &[String],
        query: &str,
        params: &Params,
    ) -> Result<String, Error> {
        let mut out = String::new();
        for name in udf {
            out.push_str(&render(&self.udf(name)?, params)?);
        }
        for name in udf_js {
            out.push_str(&render(&self.udf_js(name)?, params)?);
        }
        out.push_str(&self.render_sql(query, params)?);
        Ok(out)
    }
}

/// Forces a query to return no rows: a trailing `LIMIT n` becomes `LIMIT 0`,
/// otherwise `LIMIT 0` is appended.
pub fn limit_zero(sql: &str) -> Result<String, Error> {
    static LIMIT: OnceLock<Regex> = OnceLock::new();
    let re = match LIMIT.get() {
        Some(re) => re,
        None => {
            let re = Regex::new(r"(?i)\bLIMIT\s+[0-9]+\s*;?\s*$")?;
            LIMIT.get_or_init(|| re)
        }
    };
    let trimmed = sql.trim_end();
    Ok(if re.is_match(trimmed) {
        re.replace(trimmed, "LIMIT 0").into_owned()
    } else {
        format!("{} LIMIT 0", trimmed.trim_end_matches(';').trim_end())
    })
}

/// Deletes one day of rows keyed on a date column.
pub fn generic_cleanup(table: &str, field: &str, date: &str) -> String {
    format!("DELETE FROM `{}` WHERE DATE({}) = '{}'", table, field, date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn loader(tmp: &TempDir) -> QueryLoader {
        let dirs = QueryDirs::default().rooted_at(tmp.path());
        fs::create_dir_all(&dirs.sql).unwrap();
        fs::create_dir_all(&dirs.udf).unwrap();
        fs::create_dir_all(&dirs.udf_js).unwrap();
        fs::write(
            dirs.udf.join("map_channels.sql"),
            "CREATE TEMP FUNCTION udf_map_channels(x STRING) AS (x);\n",
        )
        .unwrap();
        fs::write(
            dirs.udf_js.join("feature_mapping.sql"),
            "CREATE TEMP FUNCTION udf_js_feature_mapping(x STRING) RETURNS STRING LANGUAGE js AS \"\"\" if (x) { return x; } \"\"\";\n",
        )
        .unwrap();
        fs::write(
            dirs.sql.join("events.sql"),
            "SELECT * FROM `{project}.{dataset}.{table}` WHERE DATE(ts) BETWEEN '{start_date}' AND '{end_date}'",
        )
        .unwrap();
        QueryLoader::new(dirs)
    }

    fn params() -> Params {
        [
            ("project", "p"),
            ("dataset", "d"),
            ("table", "t"),
            ("start_date", "2019-09-01"),
            ("end_date", "2019-09-06"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_build_query_orders_udfs_first() {
        let tmp = TempDir::new().unwrap();
        let q = loader(&tmp)
            .build_query(
                &["map_channels".to_string()],
                &["feature_mapping".to_string()],
                "events",
                &params(),
            )
            .unwrap();
        let udf = q.find("udf_map_channels").unwrap();
        let js = q.find("udf_js_feature_mapping").unwrap();
        let main = q.find("SELECT * FROM `p.d.t`").unwrap();
        assert!(udf < js && js < main);
        assert!(q.ends_with("BETWEEN '2019-09-01' AND '2019-09-06'"));
    }

    #[test]
    fn test_missing_query_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let result = loader(&tmp).render_sql("nope", &params());
        assert!(matches!(result.unwrap_err(), Error::Config { .. }));
    }

    #[test]
    fn test_limit_zero() {
        assert_eq!(limit_zero("SELECT a FROM t LIMIT 100").unwrap(), "SELECT a FROM t LIMIT 0");
        assert_eq!(limit_zero("SELECT a FROM t limit 5;\n").unwrap(), "SELECT a FROM t LIMIT 0");
        assert_eq!(limit_zero("SELECT a FROM t;\n").unwrap(), "SELECT a FROM t LIMIT 0");
    }

    #[test]
    fn test_generic_cleanup() {
        assert_eq!(
            generic_cleanup("p.d.mango_feature_roi", "execution_date", "2019-09-05"),
            "DELETE FROM `p.d.mango_feature_roi` WHERE DATE(execution_date) = '2019-09-05'"
        );
    }
}
