use std::time::SystemTime;

use courier_common::Message;
use serde::{Deserialize, Serialize};

use crate::RecordId;

/// Why a message ended up in the failure store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureOrigin {
    /// The circuit breaker was open, so delivery was never attempted
    CircuitOpen,
    /// Every permitted attempt failed
    RetriesExhausted,
    /// The job could not be rendered into a deliverable message
    Rendering,
    /// Still queued when the service shut down
    Shutdown,
}

impl std::fmt::Display for FailureOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::CircuitOpen => "circuit-open",
            Self::RetriesExhausted => "retries-exhausted",
            Self::Rendering => "rendering",
            Self::Shutdown => "shutdown",
        })
    }
}

/// A message that could not be delivered, kept for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: RecordId,
    pub message: Message,
    pub reason: String,
    pub origin: FailureOrigin,
    /// Delivery attempts made before the message was set aside
    pub attempts: u32,
    pub failed_at: SystemTime,
}

impl FailedRecord {
    pub fn new(
        message: Message,
        reason: impl Into<String>,
        origin: FailureOrigin,
        attempts: u32,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            message,
            reason: reason.into(),
            origin,
            attempts,
            failed_at: SystemTime::now(),
        }
    }

    pub(crate) fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub(crate) fn decode(id: RecordId, bytes: &[u8]) -> crate::Result<Self> {
        let (record, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;

        if read != bytes.len() {
            return Err(crate::SerializationError::Trailing(id).into());
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_encoding_preserves_every_field() {
        let message = Message::new()
            .to("a@x.com")
            .cc("b@x.com")
            .bcc("c@x.com")
            .from("Sender <s@x.com>")
            .reply_to("r@x.com")
            .subject("Grüße ✉")
            .html("<p>hi\r\n there</p>")
            .text("hi\r\n there")
            .header("X-Campaign", "launch");
        let record = FailedRecord::new(message, "Connectivity: refused", FailureOrigin::RetriesExhausted, 3);

        let bytes = record.encode().unwrap();
        let decoded = FailedRecord::decode(record.id, &bytes).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let record = FailedRecord::new(
            Message::new().to("a@x.com").subject("s").text("t"),
            "reason",
            FailureOrigin::CircuitOpen,
            0,
        );
        let mut bytes = record.encode().unwrap();
        bytes.push(0);

        assert!(FailedRecord::decode(record.id, &bytes).is_err());
    }
}
