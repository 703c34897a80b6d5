//! Task lifecycle store.
//!
//! Records are flat string maps behind a key-value interface. Writers
//! overwrite records wholesale; [`RecordStore::compare_and_swap`] is there for
//! call sites that must not clobber a concurrent update.

mod memory;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::model::{space_key, task_key, SpaceDeployment, TaskRecord, SPACE_KEY_PREFIX, TASK_KEY_PREFIX};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A persisted record: field name -> value.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid record {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

/// Generic key-value record store.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Fields>, StoreError>;

    /// Insert or replace the whole record.
    fn upsert(&self, key: &str, fields: &Fields) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All records whose key starts with `prefix`, ordered by key.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError>;

    /// Replace the record only if it currently equals `expected`
    /// (`None` = absent). Returns whether the swap happened.
    fn compare_and_swap(&self, key: &str, expected: Option<&Fields>, new: &Fields) -> Result<bool, StoreError>;
}

/// Typed access to task and space records.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<dyn RecordStore>,
}

impl TaskStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self { inner }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.inner.as_ref()
    }

    pub fn task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let key = task_key(task_id);
        self.inner
            .get(&key)?
            .map(|fields| TaskRecord::from_fields(&key, &fields))
            .transpose()
    }

    pub fn save_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.inner.upsert(&record.key(), &record.to_fields())
    }

    /// Write `next` only if the stored record still equals `current`.
    pub fn replace_task(&self, current: &TaskRecord, next: &TaskRecord) -> Result<bool, StoreError> {
        self.inner
            .compare_and_swap(&next.key(), Some(&current.to_fields()), &next.to_fields())
    }

    /// Every task record. Unreadable records are skipped with a warning.
    pub fn tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.inner.scan(TASK_KEY_PREFIX)?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, fields)| match TaskRecord::from_fields(&key, &fields) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable task record");
                    None
                }
            })
            .collect())
    }

    pub fn space(&self, space_uuid: &str) -> Result<Option<SpaceDeployment>, StoreError> {
        let key = space_key(space_uuid);
        self.inner
            .get(&key)?
            .map(|fields| SpaceDeployment::from_fields(&key, &fields))
            .transpose()
    }

    pub fn save_space(&self, space: &SpaceDeployment) -> Result<(), StoreError> {
        self.inner.upsert(&space.key(), &space.to_fields())
    }

    pub fn delete_space(&self, space_uuid: &str) -> Result<bool, StoreError> {
        self.inner.delete(&space_key(space_uuid))
    }

    pub fn spaces(&self) -> Result<Vec<SpaceDeployment>, StoreError> {
        let rows = self.inner.scan(SPACE_KEY_PREFIX)?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, fields)| match SpaceDeployment::from_fields(&key, &fields) {
                Ok(space) => Some(space),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable space record");
                    None
                }
            })
            .collect())
    }

    /// Space whose `task_uuid` matches, compared case-insensitively.
    pub fn space_by_task(&self, task_uuid: &str) -> Result<Option<SpaceDeployment>, StoreError> {
        Ok(self
            .spaces()?
            .into_iter()
            .find(|s| s.task_uuid.eq_ignore_ascii_case(task_uuid)))
    }
}
