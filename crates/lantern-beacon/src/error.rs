//! Error types for lantern-beacon.

use thiserror::Error;

/// Result type for beacon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while generating or parsing beacons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A public key had the wrong length, was not a valid curve point,
    /// or was a small-order point.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// The requested time-to-live is outside `(0, ONE_DAY]`.
    #[error("invalid beacon ttl: {0:?}")]
    InvalidTtl(std::time::Duration),

    /// Sealing a beacon payload failed.
    #[error("beacon encryption failed")]
    Encryption,

    /// The beacon blob could not be decoded.
    #[error("malformed beacon: {0}")]
    MalformedBeacon(String),
}
