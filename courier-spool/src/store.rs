use async_trait::async_trait;

use crate::{FailedRecord, RecordId};

/// Storage backend for failed records.
///
/// Implementations must be durable enough for their deployment: the file store
/// survives restarts, the memory store does not.
#[async_trait]
pub trait FailureStore: Send + Sync + std::fmt::Debug {
    /// Persist a record under its own id
    async fn write(&self, record: &FailedRecord) -> crate::Result<()>;

    /// All stored ids, oldest first
    async fn list(&self) -> crate::Result<Vec<RecordId>>;

    async fn read(&self, id: &RecordId) -> crate::Result<FailedRecord>;

    async fn delete(&self, id: &RecordId) -> crate::Result<()>;
}
