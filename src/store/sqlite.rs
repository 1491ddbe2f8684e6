//! SQLite state store
//!
//! One row per `(device_id, param)`. The upsert is a single conditional
//! `INSERT .. ON CONFLICT DO UPDATE .. WHERE`, so SQLite's write lock is what
//! linearizes concurrent writers to the same key.

use super::{StateRecord, StateStore, UpsertOutcome};
use crate::error::StoreError;
use crate::xmlrpc::{Value, ValueKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS device_states (
        device_id TEXT NOT NULL,
        param TEXT NOT NULL,
        interface TEXT NOT NULL DEFAULT '',
        value TEXT NOT NULL DEFAULT '',
        value_type TEXT NOT NULL DEFAULT 'string',
        last_updated INTEGER NOT NULL,
        PRIMARY KEY (device_id, param)
    )
"#;

const UPSERT: &str = r#"
    INSERT INTO device_states (device_id, param, interface, value, value_type, last_updated)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(device_id, param) DO UPDATE SET
        interface = excluded.interface,
        value = excluded.value,
        value_type = excluded.value_type,
        last_updated = excluded.last_updated
    WHERE excluded.last_updated >= device_states.last_updated
"#;

const SELECT_COLUMNS: &str =
    "SELECT device_id, param, interface, value, value_type, last_updated FROM device_states";

/// `sqlx`-backed [`StateStore`]
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Schema(format!("cannot create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!(path = %path.display(), "State store ready");
        Ok(store)
    }

    /// Private in-memory database, single connection so all callers share it
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        debug!("Initializing database schema");
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<StateRecord, StoreError> {
        let value_type: String = row.try_get("value_type")?;
        let text: String = row.try_get("value")?;
        let micros: i64 = row.try_get("last_updated")?;

        let kind = ValueKind::parse(&value_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown value type '{value_type}'")))?;
        let value = Value::from_stored(kind, &text)
            .ok_or_else(|| StoreError::Corrupt(format!("'{text}' is not a valid {value_type}")))?;
        let last_updated = DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| StoreError::Corrupt(format!("timestamp {micros} out of range")))?;

        Ok(StateRecord {
            device_id: row.try_get("device_id")?,
            parameter: row.try_get("param")?,
            interface: row.try_get("interface")?,
            value,
            last_updated,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn upsert(&self, record: StateRecord) -> Result<UpsertOutcome, StoreError> {
        let (kind, text) = record
            .value
            .to_stored()
            .ok_or_else(|| StoreError::UnsupportedValue(record.value.to_string()))?;

        let result = sqlx::query(UPSERT)
            .bind(&record.device_id)
            .bind(&record.parameter)
            .bind(&record.interface)
            .bind(text)
            .bind(kind.as_str())
            .bind(record.last_updated.timestamp_micros())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!(
                device = %record.device_id,
                param = %record.parameter,
                "Discarding stale value"
            );
            Ok(UpsertOutcome::Superseded)
        } else {
            Ok(UpsertOutcome::Written)
        }
    }

    async fn get(
        &self,
        device_id: &str,
        parameter: &str,
    ) -> Result<Option<StateRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE device_id = ?1 AND param = ?2"))
            .bind(device_id)
            .bind(parameter)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<StateRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY device_id, param"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn record(device: &str, param: &str, value: Value, secs: i64) -> StateRecord {
        StateRecord::new(
            device,
            param,
            "HmIP-RF",
            value,
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let event = record("HM1", "STATE", Value::Boolean(true), 1_700_000_000);

        store.upsert(event.clone()).await.unwrap();
        store.upsert(event.clone()).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all, vec![event]);
    }

    #[tokio::test]
    async fn test_scalar_types_survive_storage() {
        let store = SqliteStore::in_memory().await.unwrap();
        let values = [
            ("A", Value::Boolean(false)),
            ("B", Value::Int(3)),
            ("C", Value::Double(19.5)),
            ("D", Value::from("CLOSED")),
        ];
        for (device, value) in &values {
            store
                .upsert(record(device, "P", value.clone(), 10))
                .await
                .unwrap();
        }

        for (device, value) in &values {
            let stored = store.get(device, "P").await.unwrap().unwrap();
            assert_eq!(&stored.value, value);
        }
    }

    #[tokio::test]
    async fn test_newest_timestamp_wins_regardless_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("state.db")).await.unwrap());

        for i in 0..10 {
            let device = format!("d{i}");
            let newer = record(&device, "p", Value::Int(2), 200);
            let older = record(&device, "p", Value::Int(1), 100);
            let (a, b) = (store.clone(), store.clone());
            let newer_task = async move { a.upsert(newer).await };
            let older_task = async move { b.upsert(older).await };

            // Alternate which write is spawned first
            let (newer_result, older_result) = if i % 2 == 0 {
                let older_handle = tokio::spawn(older_task);
                let newer_handle = tokio::spawn(newer_task);
                (newer_handle.await, older_handle.await)
            } else {
                let newer_handle = tokio::spawn(newer_task);
                let older_handle = tokio::spawn(older_task);
                (newer_handle.await, older_handle.await)
            };
            assert_eq!(newer_result.unwrap().unwrap(), UpsertOutcome::Written);
            older_result.unwrap().unwrap();

            let stored = store.get(&device, "p").await.unwrap().unwrap();
            assert_eq!(stored.value, Value::Int(2));
            assert_eq!(stored.last_updated, Utc.timestamp_opt(200, 0).unwrap());
        }
        assert_eq!(store.list().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_late_older_write_is_superseded() {
        let store = SqliteStore::in_memory().await.unwrap();

        let newer = store
            .upsert(record("HM1", "STATE", Value::Boolean(true), 200))
            .await
            .unwrap();
        let older = store
            .upsert(record("HM1", "STATE", Value::Boolean(false), 100))
            .await
            .unwrap();

        assert_eq!(newer, UpsertOutcome::Written);
        assert_eq!(older, UpsertOutcome::Superseded);
        let stored = store.get("HM1", "STATE").await.unwrap().unwrap();
        assert_eq!(stored.value, Value::Boolean(true));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store
                .upsert(record("HM1", "LEVEL", Value::Double(0.5), 42))
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).await.unwrap();
        let stored = reopened.get("HM1", "LEVEL").await.unwrap().unwrap();
        assert_eq!(stored.value, Value::Double(0.5));
        assert_eq!(stored.interface, "HmIP-RF");
    }

    #[tokio::test]
    async fn test_unknown_key_is_none() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.get("HM1", "STATE").await.unwrap().is_none());
    }
}
