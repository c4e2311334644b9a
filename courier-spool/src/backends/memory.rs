use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{FailedRecord, RecordId, SpoolError, store::FailureStore};

/// In-memory failure store
///
/// Records live in a `HashMap` behind an `RwLock` and vanish with the process.
/// Meant for tests and for deployments that accept losing failed mail on
/// restart. An optional capacity makes writes fail instead of growing without
/// bound.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub(crate) records: Arc<RwLock<HashMap<RecordId, FailedRecord>>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers the data if the lock was poisoned
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn write(&self, record: &FailedRecord) -> crate::Result<()> {
        let mut records = self.records.write()?;

        if records.contains_key(&record.id) {
            return Err(SpoolError::AlreadyExists(record.id));
        }

        if let Some(capacity) = self.capacity
            && records.len() >= capacity
        {
            return Err(SpoolError::CapacityExceeded {
                len: records.len(),
                capacity,
            });
        }

        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<RecordId>> {
        let mut ids: Vec<_> = self.records.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &RecordId) -> crate::Result<FailedRecord> {
        self.records
            .read()?
            .get(id)
            .cloned()
            .ok_or(SpoolError::NotFound(*id))
    }

    async fn delete(&self, id: &RecordId) -> crate::Result<()> {
        self.records
            .write()?
            .remove(id)
            .map(|_| ())
            .ok_or(SpoolError::NotFound(*id))
    }
}
