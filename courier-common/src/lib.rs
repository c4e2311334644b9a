pub mod error;
pub mod logging;
pub mod message;

pub use error::ValidationError;
pub use message::Message;
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
