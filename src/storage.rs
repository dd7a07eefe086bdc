use crate::usage::{ModelUsage, TokenUsage};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_entries (
                timestamp TEXT NOT NULL,
                session_id TEXT NOT NULL,
                project_path TEXT NOT NULL,
                model TEXT NOT NULL,
                message_id TEXT,
                request_id TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0.0
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_entries schema")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_usage_entries_timestamp
            ON usage_entries(timestamp);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_entries timestamp index")?;

        // NULL ids never collide, so entries without both ids are always kept.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_entries_message_request
            ON usage_entries(message_id, request_id);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_entries dedup index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_state (
                path TEXT PRIMARY KEY,
                last_offset INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure ingest_state schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure preferences schema")?;

        Ok(())
    }

    /// Drops ingested usage and scan offsets; preferences survive.
    pub async fn truncate_usage(&self) -> Result<()> {
        sqlx::query("DELETE FROM usage_entries;")
            .execute(&*self.pool)
            .await
            .with_context(|| "failed to truncate usage_entries")?;
        sqlx::query("DELETE FROM ingest_state;")
            .execute(&*self.pool)
            .await
            .with_context(|| "failed to truncate ingest_state")?;
        Ok(())
    }

    /// Returns `false` when the entry was already stored.
    pub async fn insert_entry(&self, entry: &NewEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_entries (
                timestamp, session_id, project_path, model, message_id, request_id,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cost_usd
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(format_timestamp(entry.timestamp))
        .bind(&entry.session_id)
        .bind(&entry.project_path)
        .bind(&entry.model)
        .bind(entry.message_id.as_deref())
        .bind(entry.request_id.as_deref())
        .bind(to_i64(entry.tokens.input_tokens))
        .bind(to_i64(entry.tokens.output_tokens))
        .bind(to_i64(entry.tokens.cache_creation_input_tokens))
        .bind(to_i64(entry.tokens.cache_read_input_tokens))
        .bind(entry.cost_usd)
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to insert usage entry")?;

        Ok(result.rows_affected() > 0)
    }

    /// Per-model totals for `[start, end)`.
    pub async fn model_totals_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ModelUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                model,
                COALESCE(SUM(input_tokens), 0) AS input_tokens,
                COALESCE(SUM(output_tokens), 0) AS output_tokens,
                COALESCE(SUM(cache_creation_tokens), 0) AS cache_creation_tokens,
                COALESCE(SUM(cache_read_tokens), 0) AS cache_read_tokens,
                COALESCE(SUM(cost_usd), 0.0) AS cost_usd
            FROM usage_entries
            WHERE timestamp >= ? AND timestamp < ?
            GROUP BY model
            ORDER BY model
            "#,
        )
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load model totals")?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            models.push(ModelUsage {
                model: row.try_get("model")?,
                tokens: read_tokens(&row),
                cost_usd: row.try_get::<f64, _>("cost_usd").unwrap_or(0.0),
            });
        }
        Ok(models)
    }

    /// Raw entries for `[start, end)`, oldest first.
    pub async fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT
                timestamp, session_id, project_path, model,
                input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, cost_usd
            FROM usage_entries
            WHERE timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(format_timestamp(start))
        .bind(format_timestamp(end))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load usage entries")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("timestamp")?;
            let timestamp = DateTime::parse_from_rfc3339(&raw)
                .with_context(|| format!("invalid timestamp stored in DB: {raw}"))?
                .with_timezone(&Utc);
            entries.push(StoredEntry {
                timestamp,
                session_id: row.try_get("session_id")?,
                project_path: row.try_get("project_path")?,
                model: row.try_get("model")?,
                tokens: read_tokens(&row),
                cost_usd: row.try_get::<f64, _>("cost_usd").unwrap_or(0.0),
            });
        }
        Ok(entries)
    }

    pub async fn load_ingest_state(&self) -> Result<Vec<IngestStateRow>> {
        let rows = sqlx::query("SELECT path, last_offset FROM ingest_state")
            .fetch_all(&*self.pool)
            .await
            .with_context(|| "failed to load ingest state")?;

        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            states.push(IngestStateRow {
                path: PathBuf::from(path),
                last_offset: row.try_get::<i64, _>("last_offset").unwrap_or(0).max(0) as u64,
            });
        }
        Ok(states)
    }

    pub async fn upsert_ingest_state(&self, state: &IngestStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_state (path, last_offset) VALUES (?, ?)
            ON CONFLICT(path) DO UPDATE SET last_offset = excluded.last_offset;
            "#,
        )
        .bind(state.path.to_string_lossy().into_owned())
        .bind(to_i64(state.last_offset))
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to upsert ingest state")?;
        Ok(())
    }

    pub async fn preference(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .with_context(|| format!("failed to read preference {key}"))?;
        Ok(row.map(|row| row.try_get::<String, _>("value")).transpose()?)
    }

    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await
        .with_context(|| format!("failed to write preference {key}"))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub project_path: String,
    pub model: String,
    pub message_id: Option<String>,
    pub request_id: Option<String>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub project_path: String,
    pub model: String,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestStateRow {
    pub path: PathBuf,
    pub last_offset: u64,
}

// Fixed width, UTC, so lexical order in SQLite matches time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn read_tokens(row: &SqliteRow) -> TokenUsage {
    let read = |column: &str| row.try_get::<i64, _>(column).unwrap_or(0).max(0) as u64;
    TokenUsage {
        input_tokens: read("input_tokens"),
        output_tokens: read("output_tokens"),
        cache_creation_input_tokens: read("cache_creation_tokens"),
        cache_read_input_tokens: read("cache_read_tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    async fn open() -> (NamedTempFile, Storage) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        (db_file, storage)
    }

    fn entry(minute: i64, model: &str, input: u64, cost: f64) -> NewEntry {
        NewEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 11, 14, 9, 0, 0).unwrap()
                + ChronoDuration::minutes(minute),
            session_id: "session-a".to_string(),
            project_path: "/work/app".to_string(),
            model: model.to_string(),
            message_id: None,
            request_id: None,
            tokens: TokenUsage {
                input_tokens: input,
                output_tokens: input * 2,
                cache_creation_input_tokens: 1,
                cache_read_input_tokens: 0,
            },
            cost_usd: cost,
        }
    }

    #[tokio::test]
    async fn model_totals_group_by_model_within_range() {
        let (_db, storage) = open().await;
        storage.insert_entry(&entry(0, "claude-sonnet-4-5", 100, 0.5)).await.unwrap();
        storage.insert_entry(&entry(10, "claude-sonnet-4-5", 50, 0.25)).await.unwrap();
        storage.insert_entry(&entry(20, "claude-opus-4-5", 10, 1.0)).await.unwrap();
        storage.insert_entry(&entry(120, "claude-opus-4-5", 999, 9.0)).await.unwrap();

        let start = Utc.with_ymd_and_hms(2025, 11, 14, 9, 0, 0).unwrap();
        let end = start + ChronoDuration::hours(1);
        let totals = storage.model_totals_between(start, end).await.unwrap();

        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].model, "claude-opus-4-5");
        assert_eq!(totals[0].tokens.input_tokens, 10);
        assert!((totals[0].cost_usd - 1.0).abs() < f64::EPSILON);
        assert_eq!(totals[1].model, "claude-sonnet-4-5");
        assert_eq!(totals[1].tokens.input_tokens, 150);
        assert_eq!(totals[1].tokens.output_tokens, 300);
        assert_eq!(totals[1].tokens.cache_creation_input_tokens, 2);
        assert!((totals[1].cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn entries_between_returns_oldest_first() {
        let (_db, storage) = open().await;
        storage.insert_entry(&entry(30, "m", 3, 0.0)).await.unwrap();
        storage.insert_entry(&entry(5, "m", 1, 0.0)).await.unwrap();
        storage.insert_entry(&entry(15, "m", 2, 0.0)).await.unwrap();

        let start = Utc.with_ymd_and_hms(2025, 11, 14, 0, 0, 0).unwrap();
        let entries = storage
            .entries_between(start, start + ChronoDuration::days(1))
            .await
            .unwrap();

        let inputs: Vec<u64> = entries.iter().map(|e| e.tokens.input_tokens).collect();
        assert_eq!(inputs, vec![1, 2, 3]);
        assert_eq!(entries[0].session_id, "session-a");
    }

    #[tokio::test]
    async fn duplicate_message_request_pairs_are_ignored() {
        let (_db, storage) = open().await;
        let mut first = entry(0, "m", 10, 0.1);
        first.message_id = Some("msg_1".to_string());
        first.request_id = Some("req_1".to_string());

        assert!(storage.insert_entry(&first).await.unwrap());
        assert!(!storage.insert_entry(&first).await.unwrap());

        let anonymous = entry(1, "m", 10, 0.1);
        assert!(storage.insert_entry(&anonymous).await.unwrap());
        assert!(storage.insert_entry(&anonymous).await.unwrap());
    }

    #[tokio::test]
    async fn preferences_and_ingest_state_round_trip_and_survive_truncate() {
        let (_db, storage) = open().await;
        assert_eq!(storage.preference("plan").await.unwrap(), None);

        storage.set_preference("plan", "max5").await.unwrap();
        storage.set_preference("plan", "max20").await.unwrap();
        storage
            .upsert_ingest_state(&IngestStateRow {
                path: PathBuf::from("/logs/a.jsonl"),
                last_offset: 42,
            })
            .await
            .unwrap();
        storage.insert_entry(&entry(0, "m", 1, 0.0)).await.unwrap();

        assert_eq!(storage.load_ingest_state().await.unwrap().len(), 1);
        storage.truncate_usage().await.unwrap();

        assert_eq!(
            storage.preference("plan").await.unwrap().as_deref(),
            Some("max20")
        );
        assert!(storage.load_ingest_state().await.unwrap().is_empty());
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(
            storage
                .entries_between(start, start + ChronoDuration::days(365))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
