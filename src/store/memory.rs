//! In-memory state store
//!
//! Data is lost when the process exits. Used by tests and as a fallback when
//! no database path is configured.

use super::{StateRecord, StateStore, UpsertOutcome};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type Key = (String, String);

/// Map-backed [`StateStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<Key, StateRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert(&self, record: StateRecord) -> Result<UpsertOutcome, StoreError> {
        if record.value.to_stored().is_none() {
            return Err(StoreError::UnsupportedValue(record.value.to_string()));
        }

        let key = (record.device_id.clone(), record.parameter.clone());
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&key) {
            if existing.last_updated > record.last_updated {
                debug!(
                    device = %record.device_id,
                    param = %record.parameter,
                    "Discarding stale value"
                );
                return Ok(UpsertOutcome::Superseded);
            }
        }
        records.insert(key, record);
        Ok(UpsertOutcome::Written)
    }

    async fn get(
        &self,
        device_id: &str,
        parameter: &str,
    ) -> Result<Option<StateRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(device_id.to_string(), parameter.to_string()))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<StateRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
