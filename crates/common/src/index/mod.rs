//! Local index backed by SQLite.
//!
//! Holds everything a safe learns from its store so that listing and lookups
//! never scan the store: decrypted headers, the batches already read, the
//! sync watermark of each zone and the merged zone state with its keys.

mod headers;

use std::path::Path;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Row,
};

pub use headers::{CachedEntry, GroupEntry, ListOptions, OrderBy};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Progress of the file sync of one zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    /// Touch value of the zone when it was last fully indexed
    pub touch: String,
    /// First bucket the next sync must scan
    pub bucket: String,
}

/// SQLite connection pool shared by every safe using the same index.
#[derive(Debug, Clone)]
pub struct Index {
    pool: SqlitePool,
}

impl Index {
    /// Open or create an index file.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.run_migrations().await?;
        Ok(index)
    }

    /// Create an in-memory index.
    ///
    /// The pool keeps its single connection alive, the database lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.run_migrations().await?;
        Ok(index)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Whether the header batch at `path` was already indexed.
    pub async fn is_batch_processed(&self, safe: &str, zone: &str, path: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM batches WHERE safe = ? AND zone = ? AND path = ?")
            .bind(safe)
            .bind(zone)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn mark_batch_processed(&self, safe: &str, zone: &str, path: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO batches (safe, zone, path) VALUES (?, ?, ?)")
            .bind(safe)
            .bind(zone)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn watermark(&self, safe: &str, zone: &str) -> Result<Option<Watermark>> {
        let row = sqlx::query("SELECT touch, bucket FROM watermarks WHERE safe = ? AND zone = ?")
            .bind(safe)
            .bind(zone)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Watermark {
            touch: r.get("touch"),
            bucket: r.get("bucket"),
        }))
    }

    pub async fn set_watermark(&self, safe: &str, zone: &str, watermark: &Watermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (safe, zone, touch, bucket)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(safe, zone) DO UPDATE SET
                touch = excluded.touch,
                bucket = excluded.bucket
            "#,
        )
        .bind(safe)
        .bind(zone)
        .bind(&watermark.touch)
        .bind(&watermark.bucket)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the serialized state of a zone.
    pub async fn save_zone(&self, safe: &str, name: &str, state: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (safe, name, state)
            VALUES (?, ?, ?)
            ON CONFLICT(safe, name) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(safe)
        .bind(name)
        .bind(state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All zones saved for `safe` as `(name, state)`.
    pub async fn load_zones(&self, safe: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT name, state FROM zones WHERE safe = ? ORDER BY name")
            .bind(safe)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("state")))
            .collect())
    }

    /// Forget a zone and everything indexed from it.
    pub async fn delete_zone(&self, safe: &str, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["zones", "watermarks", "batches", "headers"] {
            let column = if table == "zones" { "name" } else { "zone" };
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE safe = ? AND {column} = ?"
            ))
            .bind(safe)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_watermark_and_batches() {
        let index = Index::in_memory().await.unwrap();
        assert!(index.watermark("s", "main").await.unwrap().is_none());

        let watermark = Watermark {
            touch: "t1".to_string(),
            bucket: "20240101".to_string(),
        };
        index.set_watermark("s", "main", &watermark).await.unwrap();
        assert_eq!(index.watermark("s", "main").await.unwrap(), Some(watermark));

        assert!(!index.is_batch_processed("s", "main", "a.h").await.unwrap());
        index.mark_batch_processed("s", "main", "a.h").await.unwrap();
        index.mark_batch_processed("s", "main", "a.h").await.unwrap();
        assert!(index.is_batch_processed("s", "main", "a.h").await.unwrap());
        assert!(!index.is_batch_processed("s", "other", "a.h").await.unwrap());
    }

    #[tokio::test]
    async fn test_zones() {
        let index = Index::in_memory().await.unwrap();
        index.save_zone("s", "main", "{}").await.unwrap();
        index.save_zone("s", "main", "{\"a\":1}").await.unwrap();
        index.save_zone("s", "docs", "{}").await.unwrap();
        let zones = index.load_zones("s").await.unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[1], ("main".to_string(), "{\"a\":1}".to_string()));

        index.delete_zone("s", "main").await.unwrap();
        assert_eq!(index.load_zones("s").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_index() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("index.db");
        let index = Index::new(&path).await.unwrap();
        index.save_zone("s", "main", "{}").await.unwrap();
        index.close().await;

        let reopened = Index::new(&path).await.unwrap();
        assert_eq!(reopened.load_zones("s").await.unwrap().len(), 1);
    }
}
