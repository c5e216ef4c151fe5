//! Error types for lantern-protocols.

use thiserror::Error;

use crate::queue::QueueError;
use crate::quit::QuitError;

/// Result type for lantern-protocols operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The serialized operation queue rejected or lost an operation.
    #[error("operation queue error: {0}")]
    Queue(#[from] QueueError),

    /// A registration was attempted on a raised quit signal.
    #[error(transparent)]
    Quit(#[from] QuitError),

    /// Round numbers travel as a single ASCII digit.
    #[error("invalid round number {0}: must be between 0 and 9")]
    InvalidRound(u32),

    /// A wire message or identifier could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A round exchange failed in a way worth retrying.
    #[error("non-fatal protocol error: {0}")]
    NonFatal(String),

    /// A round exchange failed in a way that invalidates the whole round.
    #[error("fatal protocol error: {0}")]
    Fatal(String),

    /// The work was torn down by a quit signal.
    #[error("cancelled by quit signal")]
    Cancelled,

    /// A round did not complete in time.
    #[error("round timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must abort the enclosing round.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}
