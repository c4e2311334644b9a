//! Errors raised while checking a [`Message`](crate::Message) before it is
//! accepted into the pipeline.

use thiserror::Error;

/// A message that can never be delivered as written.
///
/// These are reported straight back to the caller and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message has no recipients")]
    NoRecipients,

    #[error("Message subject is empty")]
    EmptySubject,

    #[error("Message has neither an HTML nor a plain-text body")]
    NoBody,

    #[error("Invalid {field} address: {address}")]
    InvalidAddress { field: &'static str, address: String },

    #[error("Invalid header name: {0}")]
    InvalidHeader(String),
}
