//! SQLite-backed run state: per-object checkpoints and table column state.
//!
//! A checkpoint is written exactly once per object type per run, after that
//! type's pagination completed cleanly. A failed object type never advances
//! its checkpoint, so the next run re-fetches from the same watermark —
//! at-least-once delivery, which is why downstream incremental loading must
//! upsert rather than append.
//!
//! The store also remembers each output table's final column list. Columns
//! observed in earlier runs stay part of the schema even when the current
//! property selection shrinks, keeping destination tables stable.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::error::{ExtractError, Result};

/// Subtracted from a stored watermark when it bounds an incremental fetch,
/// absorbing records that changed while the previous run was writing.
pub const WATERMARK_SAFETY_MARGIN_MS: i64 = 3_600_000;

/// Sync progress for one object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Modified-since watermark in epoch milliseconds.
    pub watermark_ms: i64,
    /// When the run that wrote this checkpoint started, epoch seconds.
    pub run_timestamp: i64,
}

pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ExtractError::Configuration(format!(
                    "cannot create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                object_type   TEXT PRIMARY KEY,
                watermark     TEXT NOT NULL,
                run_timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS table_columns (
                table_name TEXT PRIMARY KEY,
                columns    TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get(&self, object_type: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT watermark, run_timestamp FROM checkpoints WHERE object_type = ?",
        )
        .bind(object_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(watermark, run_timestamp)| {
            watermark.parse::<i64>().ok().map(|watermark_ms| Checkpoint {
                watermark_ms,
                run_timestamp,
            })
        }))
    }

    pub async fn set(&self, object_type: &str, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (object_type, watermark, run_timestamp) VALUES (?, ?, ?)
            ON CONFLICT(object_type) DO UPDATE SET
                watermark = excluded.watermark,
                run_timestamp = excluded.run_timestamp
            "#,
        )
        .bind(object_type)
        .bind(checkpoint.watermark_ms.to_string())
        .bind(checkpoint.run_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The column list this table ended up with after its last run.
    pub async fn get_columns(&self, table_name: &str) -> Result<Option<Vec<String>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT columns FROM table_columns WHERE table_name = ?")
                .bind(table_name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(json,)| serde_json::from_str(&json).ok()))
    }

    pub async fn set_columns(&self, table_name: &str, columns: &[String]) -> Result<()> {
        let json = serde_json::to_string(columns).expect("string lists always serialize");
        sqlx::query(
            r#"
            INSERT INTO table_columns (table_name, columns) VALUES (?, ?)
            ON CONFLICT(table_name) DO UPDATE SET columns = excluded.columns
            "#,
        )
        .bind(table_name)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, CheckpointStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&tmp.path().join("state.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let (_tmp, store) = store().await;
        assert_eq!(store.get("contact").await.unwrap(), None);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_and_overwrite() {
        let (_tmp, store) = store().await;

        let first = Checkpoint {
            watermark_ms: 1_700_000_000_000,
            run_timestamp: 1_700_000_000,
        };
        store.set("contact", &first).await.unwrap();
        assert_eq!(store.get("contact").await.unwrap(), Some(first));

        let second = Checkpoint {
            watermark_ms: 1_700_086_400_000,
            run_timestamp: 1_700_086_400,
        };
        store.set("contact", &second).await.unwrap();
        assert_eq!(store.get("contact").await.unwrap(), Some(second));

        // Other object types are untouched.
        assert_eq!(store.get("company").await.unwrap(), None);
    }

    #[tokio::test]
    async fn column_state_roundtrip() {
        let (_tmp, store) = store().await;

        assert_eq!(store.get_columns("contact").await.unwrap(), None);

        let columns = vec!["id".to_string(), "email".to_string()];
        store.set_columns("contact", &columns).await.unwrap();
        assert_eq!(store.get_columns("contact").await.unwrap(), Some(columns));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.sqlite");

        let store = CheckpointStore::open(&path).await.unwrap();
        store
            .set(
                "deal",
                &Checkpoint {
                    watermark_ms: 42,
                    run_timestamp: 7,
                },
            )
            .await
            .unwrap();
        store.close().await;

        let reopened = CheckpointStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("deal").await.unwrap(),
            Some(Checkpoint {
                watermark_ms: 42,
                run_timestamp: 7,
            })
        );
    }
}
