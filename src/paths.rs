use crate::marshalling::Format;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

pub const RAW_STAGE: &str = "raw";

/// Path layout shared by the filesystem cache and the object store mirror:
/// `{prefix}{stage}-{task}-{source}/{date}.{page}.{ext}` for raw payloads and
/// `{prefix}{stage}-{task}-{source}/{date}.{ext}` for staged files.
#[derive(Debug, Clone)]
pub struct PathLayout {
    task: String,
    fs_prefix: String,
    remote_prefix: String,
}

impl PathLayout {
    pub fn new(task: &str, fs_prefix: &str, remote_prefix: &str) -> Self {
        PathLayout {
            task: task.to_string(),
            fs_prefix: fs_prefix.to_string(),
            remote_prefix: remote_prefix.to_string(),
        }
    }

    pub fn source_dir(&self, stage: &str, source: &str) -> String {
        format!("{}-{}-{}", stage, self.task, source)
    }

    pub fn raw_relative(&self, source: &str, date: NaiveDate, page: &str, format: Format) -> String {
        format!(
            "{}/{}.{}.{}",
            self.source_dir(RAW_STAGE, source),
            date.format(crate::dates::DEFAULT_DATE_FORMAT),
            page,
            format.extension()
        )
    }

    pub fn staged_relative(&self, stage: &str, source: &str, date: NaiveDate, format: Format) -> String {
        format!(
            "{}/{}.{}",
            self.source_dir(stage, source),
            date.format(crate::dates::DEFAULT_DATE_FORMAT),
            format.extension()
        )
    }

    pub fn local(&self, relative: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.fs_prefix, relative))
    }

    pub fn local_dir(&self, stage: &str, source: &str) -> PathBuf {
        self.local(&self.source_dir(stage, source))
    }

    pub fn remote(&self, relative: &str) -> String {
        format!("{}{}", self.remote_prefix, relative)
    }

    /// Raw pages cached locally for `date`, ordered by page (numeric pages
    /// first, then iterator ids by name). Returns `(page, path)` pairs.
    pub fn cached_pages(
        &self,
        source: &str,
        date: NaiveDate,
        format: Format,
    ) -> std::io::Result<Vec<(String, PathBuf)>> {
        let dir = self.local_dir(RAW_STAGE, source);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let date_prefix = format!("{}.", date.format(crate::dates::DEFAULT_DATE_FORMAT));
        let ext_suffix = format!(".{}", format.extension());
        let mut pages = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(page) = name
                .strip_prefix(&date_prefix)
                .and_then(|rest| rest.strip_suffix(&ext_suffix))
            {
                if !page.is_empty() && !page.contains('.') {
                    pages.push((page.to_string(), path.clone()));
                }
            }
        }
        pages.sort_by(|(a, _), (b, _)| page_key(a).cmp(&page_key(b)));
        Ok(pages)
    }
}

fn page_key(page: &str) -> (u8, u64, String) {
    match page.parse::<u64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, page.to_string()),
    }
}

/// Creates the parent directory of `path` when missing.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2019, 9, 6).unwrap()
    }

    #[test]
    fn test_layout() {
        let layout = PathLayout::new("revenue", "./data/", "mango/");
        assert_eq!(
            layout.raw_relative("bukalapak", date(), "2", Format::Json),
            "raw-revenue-bukalapak/2019-09-06.2.json"
        );
        assert_eq!(
            layout.staged_relative("staging", "bukalapak", date(), Format::Jsonl),
            "staging-revenue-bukalapak/2019-09-06.jsonl"
        );
        assert_eq!(
            layout.local("raw-revenue-bukalapak/2019-09-06.1.json"),
            PathBuf::from("./data/raw-revenue-bukalapak/2019-09-06.1.json")
        );
        assert_eq!(
            layout.remote("staging-revenue-bukalapak/2019-09-06.jsonl"),
            "mango/staging-revenue-bukalapak/2019-09-06.jsonl"
        );
    }

    #[test]
    fn test_cached_pages_sorted() {
        let tmp = TempDir::new().unwrap();
        let prefix = format!("{}/", tmp.path().display());
        let layout = PathLayout::new("revenue", &prefix, "");
        for page in ["10", "2", "1"] {
            let path = layout.local(&layout.raw_relative("bukalapak", date(), page, Format::Json));
            ensure_parent(&path).unwrap();
            std::fs::write(&path, "[]").unwrap();
        }
        let other_day = layout.local(&layout.raw_relative(
            "bukalapak",
            NaiveDate::from_ymd_opt(2019, 9, 5).unwrap(),
            "1",
            Format::Json,
        ));
        std::fs::write(other_day, "[]").unwrap();

        let pages: Vec<String> = layout
            .cached_pages("bukalapak", date(), Format::Json)
            .unwrap()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(pages, vec!["1", "2", "10"]);
        assert!(layout
            .cached_pages("missing", date(), Format::Json)
            .unwrap()
            .is_empty());
    }
}
