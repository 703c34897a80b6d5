//! In-memory record store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Fields, RecordStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Fields>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn upsert(&self, key: &str, fields: &Fields) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(key.to_string(), fields.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(records.remove(key).is_some())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&Fields>, new: &Fields) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if records.get(key) != expected {
            return Ok(false);
        }
        records.insert(key.to_string(), new.clone());
        Ok(true)
    }
}
