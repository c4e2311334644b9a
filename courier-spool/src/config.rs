use std::sync::Arc;

use serde::Deserialize;

use crate::{FailureSpool, backends::MemoryStore, backends::FileStore, store::FailureStore};

/// Failure store selection
///
/// Both variants wrap a struct, so config files enable RON's
/// `unwrap_variant_newtypes` extension.
///
/// File-backed store in RON config:
/// ```ron
/// #![enable(unwrap_variant_newtypes)]
/// Courier (
///     spool: File(
///         path: "/var/spool/courier/failed",
///     ),
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// Courier (
///     spool: Memory(
///         capacity: Some(1000),
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum SpoolConfig {
    File(FileStore),
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of records to keep (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::File(FileStore::default())
    }
}

impl SpoolConfig {
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Initialise the configured store and wrap it
    ///
    /// # Errors
    /// Returns an error if the file store directory cannot be prepared
    pub fn into_spool(self) -> crate::Result<FailureSpool> {
        let store: Arc<dyn FailureStore> = match self {
            Self::File(mut store) => {
                store.init()?;
                Arc::new(store)
            }
            Self::Memory(config) => config
                .capacity
                .map_or_else(MemoryStore::new, MemoryStore::with_capacity)
                .into_arc(),
        };

        Ok(FailureSpool::new(store))
    }
}

impl MemoryStore {
    fn into_arc(self) -> Arc<dyn FailureStore> {
        Arc::new(self)
    }
}
