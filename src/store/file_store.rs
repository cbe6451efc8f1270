//! Directory-backed record store: one JSON file per record under a root.
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::store::{Record, RecordContent, RecordStore};

/// Stores each record as pretty-printed JSON at `<root>/<name>`.
///
/// Paths passed to the directory helpers are relative to the root.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Use `root` as the store directory. Nothing is touched until first use.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Like [`FileStore::new`], creating `root` (and parents) if missing.
    pub async fn create(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(Self { root })
    }

    /// The store directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    async fn entries(&self, dir: &Path) -> anyhow::Result<Vec<String>> {
        let path = self.resolve(dir);
        let mut rd = fs::read_dir(&path)
            .await
            .with_context(|| format!("read_dir {}", path.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Visible entries (no leading dot) of a directory under the root.
    pub async fn list_at(&self, dir: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
        let mut names = self.entries(dir.as_ref()).await?;
        names.retain(|n| !n.starts_with('.'));
        Ok(names)
    }

    /// Entries without an extension, i.e. no `.` anywhere in the name.
    pub async fn list_dirs(&self, dir: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
        let mut names = self.entries(dir.as_ref()).await?;
        names.retain(|n| !n.contains('.'));
        Ok(names)
    }

    /// Create a directory under the root.
    pub async fn make_dir(&self, dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = self.resolve(dir);
        fs::create_dir(&path)
            .await
            .with_context(|| format!("mkdir {}", path.display()))
    }

    /// Remove an empty directory under the root.
    pub async fn remove_dir(&self, dir: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = self.resolve(dir);
        fs::remove_dir(&path)
            .await
            .with_context(|| format!("rmdir {}", path.display()))
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        self.list_at("").await
    }

    async fn read(&self, name: &str) -> anyhow::Result<RecordContent> {
        let path = self.resolve(name);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("read record {}", path.display()))?;
        Ok(RecordContent::from_text(text))
    }

    async fn write(&self, name: &str, record: &Record) -> anyhow::Result<()> {
        let path = self.resolve(name);
        let body = serde_json::to_string_pretty(record).context("serialize record")?;

        // Hidden sibling so a half-written file never shows up in `list`.
        let file_name = path
            .file_name()
            .with_context(|| format!("record name {name:?} has no file name"))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

        fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename into {}", path.display()))
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let path = self.resolve(name);
        fs::remove_file(&path)
            .await
            .with_context(|| format!("delete record {}", path.display()))
    }
}
