use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use courier_common::internal;
use serde::Deserialize;
use tokio::fs;

use crate::{FailedRecord, PathError, RecordId, SpoolError, store::FailureStore};

/// File-based failure store
///
/// Each record is one bincode file named `{ulid}.bin` inside the store
/// directory.
///
/// # Atomicity
/// Writes go to `.tmp_{ulid}.bin` and are renamed into place, so a crash never
/// leaves a half-written record visible to `list()`. Deletes rename to
/// `{ulid}.bin.deleted` before unlinking; leftovers from a crash are removed by
/// [`FileStore::init`].
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl Default for FileStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/courier/failed"),
        }
    }
}

impl<'de> Deserialize<'de> for FileStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileStoreHelper {
            path: PathBuf,
        }

        let helper = FileStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

impl FileStore {
    /// Reject `..` components, relative paths and system directories
    ///
    /// # Errors
    /// Returns the [`PathError`] describing the first problem found
    pub fn validate_path(path: &Path) -> Result<(), PathError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(PathError::Traversal(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(PathError::Relative(path.display().to_string()));
        }

        const SENSITIVE_PREFIXES: [&str; 9] = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = SENSITIVE_PREFIXES.iter().copied().find(|p| path.starts_with(p)) {
            return Err(PathError::SystemDirectory {
                prefix,
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileStoreBuilder {
        FileStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the store directory if needed and clear out crash leftovers
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    pub fn init(&mut self) -> crate::Result<()> {
        internal!("Initialising failure store at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(PathError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup_leftovers()
    }

    /// Remove `.deleted` files and abandoned `.tmp_` writes
    fn cleanup_leftovers(&self) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(".deleted") || filename.starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from failure store"
            );
        }

        Ok(())
    }

    fn record_path(&self, id: &RecordId) -> PathBuf {
        self.path.join(id.filename())
    }
}

fn not_found(id: RecordId) -> impl FnOnce(std::io::Error) -> SpoolError {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            SpoolError::NotFound(id)
        } else {
            SpoolError::Io(e)
        }
    }
}

#[async_trait]
impl FailureStore for FileStore {
    #[tracing::instrument(level = "debug", skip_all, fields(id = %record.id))]
    async fn write(&self, record: &FailedRecord) -> crate::Result<()> {
        let path = self.record_path(&record.id);

        if fs::try_exists(&path).await? {
            return Err(SpoolError::AlreadyExists(record.id));
        }

        let temp_path = self.path.join(format!(".tmp_{}", record.id.filename()));
        fs::write(&temp_path, record.encode()?).await?;
        fs::rename(&temp_path, &path).await?;

        internal!(
            level = DEBUG,
            "Stored failed record {} at {}",
            record.id,
            path.display()
        );

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self) -> crate::Result<Vec<RecordId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            if let Some(id) = RecordId::from_filename(&filename.to_string_lossy()) {
                ids.push(id);
            }
        }

        ids.sort();

        Ok(ids)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    async fn read(&self, id: &RecordId) -> crate::Result<FailedRecord> {
        let bytes = fs::read(self.record_path(id)).await.map_err(not_found(*id))?;
        FailedRecord::decode(*id, &bytes)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    async fn delete(&self, id: &RecordId) -> crate::Result<()> {
        let path = self.record_path(id);
        let deleted = self.path.join(format!("{}.deleted", id.filename()));

        fs::rename(&path, &deleted).await.map_err(not_found(*id))?;
        fs::remove_file(&deleted).await?;

        internal!(level = DEBUG, "Deleted failed record {id}");

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FileStoreBuilder {
    path: PathBuf,
}

impl FileStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// # Errors
    /// Returns an error if the path is invalid or points at a system directory
    pub fn build(self) -> Result<FileStore, PathError> {
        FileStore::validate_path(&self.path)?;
        Ok(FileStore { path: self.path })
    }
}
