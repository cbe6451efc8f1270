//! Embedded SQLite record store, for hosts that prefer a single file over
//! a directory of records.
use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tokio::task;

use crate::store::{Record, RecordContent, RecordStore};

/// Simple record table:
///   records(name TEXT PRIMARY KEY, body TEXT NOT NULL)
///
/// `body` holds the pretty-printed JSON record, exactly as the file store
/// would write it.
pub struct SqliteStore {
    path: PathBuf,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        name  TEXT PRIMARY KEY,
        body  TEXT NOT NULL
    );
"#;

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path })
    }

    fn open(path: &PathBuf) -> anyhow::Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        Ok(conn)
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || f(Self::open(&path)?)).await?
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM records WHERE name NOT LIKE '.%' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn read(&self, name: &str) -> anyhow::Result<RecordContent> {
        let name = name.to_owned();
        self.blocking(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM records WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            let body = body.with_context(|| format!("record {name:?} not found"))?;
            Ok(RecordContent::from_text(body))
        })
        .await
    }

    async fn write(&self, name: &str, record: &Record) -> anyhow::Result<()> {
        let name = name.to_owned();
        let body = serde_json::to_string_pretty(record).context("serialize record")?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO records(name, body) VALUES(?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET body=excluded.body",
                params![name, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let name = name.to_owned();
        self.blocking(move |conn| {
            let n = conn.execute("DELETE FROM records WHERE name = ?1", params![name])?;
            if n == 0 {
                anyhow::bail!("record {name:?} not found");
            }
            Ok(())
        })
        .await
    }
}
