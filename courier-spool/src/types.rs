/// Identifier for a failed record
///
/// A ULID doubles as the storage key and, for the file store, the filename.
/// ULIDs sort by creation time, so listing a store yields the oldest failures
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    id: ulid::Ulid,
}

impl RecordId {
    /// Parse a record ID from a filename like `01ARYZ6S41.bin`
    ///
    /// # Security
    /// Path separators, `..` and anything that is not a ULID are rejected so a
    /// crafted directory entry can never point outside the store.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename.strip_suffix(".bin")?;
        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self { id })
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Milliseconds since the Unix epoch at which the record was created
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }

    pub(crate) fn filename(&self) -> String {
        format!("{}.bin", self.id)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::str::FromStr for RecordId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(Self::new)
    }
}

impl serde::Serialize for RecordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_from_filename() {
        assert!(RecordId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV.bin").is_some());

        // Security
        assert!(RecordId::from_filename("../etc/passwd.bin").is_none());
        assert!(RecordId::from_filename("foo/bar.bin").is_none());
        assert!(RecordId::from_filename("..\\windows\\system32.bin").is_none());

        // Format
        assert!(RecordId::from_filename("not_a_valid_ulid.bin").is_none());
        assert!(RecordId::from_filename("01ARZ3NDEKTSV4RRFFQ69G5FAV.eml").is_none());
        assert!(RecordId::from_filename(".tmp_01ARZ3NDEKTSV4RRFFQ69G5FAV.bin").is_none());
    }

    #[test]
    fn test_filename_round_trip() {
        let id = RecordId::generate();
        assert_eq!(RecordId::from_filename(&id.filename()), Some(id));
        assert_eq!(id.to_string().parse::<RecordId>().ok(), Some(id));
    }
}
