pub mod backends;
pub mod config;
pub mod error;
pub mod record;
pub mod spool;
pub mod store;
pub mod types;

pub use backends::{FileStore, MemoryStore, TestStore};
pub use config::{MemoryConfig, SpoolConfig};
pub use error::{PathError, Result, SerializationError, SpoolError};
pub use record::{FailedRecord, FailureOrigin};
pub use spool::FailureSpool;
pub use store::FailureStore;
pub use types::RecordId;
