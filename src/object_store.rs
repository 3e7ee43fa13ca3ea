use crate::error::Error;
use crate::paths::ensure_parent;
use async_trait::async_trait;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists object names in `bucket` starting with `prefix`, sorted by name.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error>;

    /// Downloads object `name` into the local file `dest`.
    async fn download(&self, bucket: &str, name: &str, dest: &Path) -> Result<(), Error>;

    /// Uploads the local file `src` as object `name`, replacing any existing one.
    async fn upload(&self, bucket: &str, name: &str, src: &Path) -> Result<(), Error>;
}

/// Object store backed by a local directory, one subdirectory per bucket.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.root.join(bucket).join(name)
    }
}

fn store_err(path: &str, err: impl std::fmt::Display) -> Error {
    Error::ObjectStore {
        path: path.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        let bucket_dir = self.root.join(bucket);
        if !bucket_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&bucket_dir) {
            let entry = entry.map_err(|e| store_err(bucket, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&bucket_dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort();
        debug!("{} objects under {}/{}", names.len(), bucket, prefix);
        Ok(names)
    }

    async fn download(&self, bucket: &str, name: &str, dest: &Path) -> Result<(), Error> {
        let src = self.object_path(bucket, name);
        let uri = format!("{}/{}", bucket, name);
        if !src.is_file() {
            return Err(store_err(&uri, "object not found"));
        }
        ensure_parent(dest)?;
        fs::copy(&src, dest).map_err(|e| store_err(&uri, e))?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, name: &str, src: &Path) -> Result<(), Error> {
        let dest = self.object_path(bucket, name);
        let uri = format!("{}/{}", bucket, name);
        ensure_parent(&dest).map_err(|e| store_err(&uri, e))?;
        fs::copy(src, &dest).map_err(|e| store_err(&uri, e))?;
        debug!("uploaded {} to {}", src.display(), uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_list_download() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let store = LocalObjectStore::new(root.path());

        let local = work.path().join("a.jsonl");
        fs::write(&local, "{\"x\":1}\n").unwrap();
        store
            .upload("bucket", "mango/staging-adjust-trackers/2019-09-06.jsonl", &local)
            .await
            .unwrap();
        store
            .upload("bucket", "mango/staging-adjust-other/2019-09-06.jsonl", &local)
            .await
            .unwrap();

        let names = store
            .list("bucket", "mango/staging-adjust-trackers/")
            .await
            .unwrap();
        assert_eq!(names, vec!["mango/staging-adjust-trackers/2019-09-06.jsonl"]);

        let dest = work.path().join("out/b.jsonl");
        store.download("bucket", &names[0], &dest).await.unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "{\"x\":1}\n");
    }

    #[tokio::test]
    async fn test_missing_bucket_and_object() {
        let root = TempDir::new().unwrap();
        let store = LocalObjectStore::new(root.path());
        assert!(store.list("nope", "").await.unwrap().is_empty());

        let result = store
            .download("nope", "missing.json", &root.path().join("x.json"))
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::ObjectStore { path, .. } if path == "nope/missing.json"
        ));
    }
}
