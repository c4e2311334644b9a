use std::sync::Arc;

use courier_common::{Message, internal};

use crate::{FailedRecord, FailureOrigin, RecordId, store::FailureStore};

/// Best-effort front end over a [`FailureStore`].
///
/// `persist` never fails: the pipeline calls it from fallback paths where an
/// error must not travel any further, so write failures are logged and turned
/// into `None`.
#[derive(Debug, Clone)]
pub struct FailureSpool {
    store: Arc<dyn FailureStore>,
}

impl FailureSpool {
    pub fn new(store: Arc<dyn FailureStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn FailureStore> {
        &self.store
    }

    /// Record an undeliverable message
    pub async fn persist(
        &self,
        message: &Message,
        reason: &str,
        origin: FailureOrigin,
        attempts: u32,
    ) -> Option<RecordId> {
        let record = FailedRecord::new(message.clone(), reason, origin, attempts);

        match self.store.write(&record).await {
            Ok(()) => {
                internal!(
                    level = INFO,
                    record_id = %record.id,
                    %origin,
                    attempts,
                    "Stored undeliverable message: {reason}"
                );
                Some(record.id)
            }
            Err(e) => {
                internal!(
                    level = ERROR,
                    %origin,
                    error = %e,
                    "Failed to store undeliverable message for {:?}",
                    message.to
                );
                None
            }
        }
    }

    /// Every readable record, oldest first
    ///
    /// Records that fail to decode are logged and left in place.
    ///
    /// # Errors
    /// If the store cannot be listed
    pub async fn list(&self) -> crate::Result<Vec<FailedRecord>> {
        self.list_limited(usize::MAX).await
    }

    /// Like [`list`](Self::list) but stops after `limit` records
    ///
    /// # Errors
    /// If the store cannot be listed
    pub async fn list_limited(&self, limit: usize) -> crate::Result<Vec<FailedRecord>> {
        let mut records = Vec::new();

        for id in self.store.list().await? {
            if records.len() >= limit {
                break;
            }

            match self.store.read(&id).await {
                Ok(record) => records.push(record),
                Err(e) => internal!(
                    level = WARN,
                    record_id = %id,
                    error = %e,
                    "Skipping unreadable failed record"
                ),
            }
        }

        Ok(records)
    }

    /// # Errors
    /// If the record does not exist or cannot be decoded
    pub async fn read(&self, id: &RecordId) -> crate::Result<FailedRecord> {
        self.store.read(id).await
    }

    /// Drop a record once it has been handed back to the queue
    ///
    /// # Errors
    /// If the record does not exist or cannot be removed
    pub async fn remove(&self, id: &RecordId) -> crate::Result<()> {
        self.store.delete(id).await
    }

    /// # Errors
    /// If the store cannot be listed
    pub async fn len(&self) -> crate::Result<usize> {
        Ok(self.store.list().await?.len())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::TestStore;

    fn message() -> Message {
        Message::new().to("a@x.com").subject("Hi").text("hi")
    }

    #[tokio::test]
    async fn test_persist_and_list() {
        let store = TestStore::new();
        let spool = FailureSpool::new(Arc::new(store.clone()));

        let id = spool
            .persist(&message(), "circuit open", FailureOrigin::CircuitOpen, 0)
            .await
            .unwrap();

        let records = spool.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].message, message());
        assert_eq!(records[0].reason, "circuit open");
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_swallows_store_errors() {
        let store = TestStore::new();
        store.fail_writes(true);
        let spool = FailureSpool::new(Arc::new(store.clone()));

        let id = spool
            .persist(&message(), "boom", FailureOrigin::RetriesExhausted, 3)
            .await;

        assert!(id.is_none());
        assert_eq!(store.write_attempts(), 1);
        assert_eq!(spool.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_limited_and_remove() {
        let spool = FailureSpool::new(Arc::new(TestStore::new()));
        for _ in 0..5 {
            spool
                .persist(&message(), "r", FailureOrigin::Shutdown, 0)
                .await
                .unwrap();
        }

        let batch = spool.list_limited(2).await.unwrap();
        assert_eq!(batch.len(), 2);

        for record in &batch {
            spool.remove(&record.id).await.unwrap();
        }
        assert_eq!(spool.len().await.unwrap(), 3);
    }
}
