//! Durable latest-value storage per `(device, parameter)`
//!
//! Available implementations:
//! - SQLite via `sqlx` (default, survives restarts)
//! - In-memory map (tests and `--store memory`)
//!
//! Both linearize writes to the same key by receipt timestamp: a write that
//! is older than the stored record is discarded, so concurrent deliveries
//! always settle on the newest event regardless of arrival order.

pub mod memory;
pub mod sqlite;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::xmlrpc::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Latest known value of one device parameter
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub device_id: String,
    pub parameter: String,
    /// Interface the value arrived through
    pub interface: String,
    pub value: Value,
    pub last_updated: DateTime<Utc>,
}

impl StateRecord {
    pub fn new(
        device_id: impl Into<String>,
        parameter: impl Into<String>,
        interface: impl Into<String>,
        value: Value,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            parameter: parameter.into(),
            interface: interface.into(),
            value,
            last_updated,
        }
    }
}

/// What an upsert did with the submitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Record inserted or overwritten
    Written,
    /// A newer record for the same key was already stored
    Superseded,
}

/// Read/write contract of the state store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or overwrite the record for its key unless a newer one exists
    async fn upsert(&self, record: StateRecord) -> std::result::Result<UpsertOutcome, StoreError>;

    /// Fetch the record for a key, `None` when nothing was stored yet
    async fn get(
        &self,
        device_id: &str,
        parameter: &str,
    ) -> std::result::Result<Option<StateRecord>, StoreError>;

    /// All records, ordered by key
    async fn list(&self) -> std::result::Result<Vec<StateRecord>, StoreError>;
}

/// Open the store selected by configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn StateStore>> {
    match config {
        StoreConfig::Sqlite { path } => {
            info!(path = %path.display(), "Opening SQLite state store");
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
        StoreConfig::Memory => {
            info!("Using in-memory state store, values are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
