//! Error types for the Lantern node.

use lantern_protocols::QueueError;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input, such as a bad public key.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Beacon generation failed.
    #[error("Beacon error: {0}")]
    Beacon(#[from] lantern_beacon::Error),

    /// The transport failed to start or refresh advertising.
    #[error("Advertising error: {0}")]
    Advertising(#[source] TransportError),

    /// The transport failed to stop advertising or listening.
    #[error("Stop error: {0}")]
    Stop(#[source] TransportError),

    /// Any other transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A beacon download failed.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The operation queue rejected or lost the operation.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Invalid configuration value.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Fetch(e.to_string())
    }
}
