//! The radio transport seam.
//!
//! A [`Transport`] bridges to whatever actually moves bytes between
//! devices: multipeer connectivity, Android Bluetooth, or plain TCP. The
//! notification layer only drives it through this trait.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use lantern_beacon::{BeaconSecret, PublicKey};
use lantern_protocols::PeerAvailability;
use thiserror::Error;
use tokio::sync::broadcast;

/// PSK identity used for beacon downloads.
pub const BEACON_PSK_IDENTITY: &str = "beacons";

/// Well-known secret paired with [`BEACON_PSK_IDENTITY`].
///
/// Beacons are public; the PSK only keeps the HTTP exchange on the same
/// authenticated channel as data connections.
pub const BEACON_PSK_SECRET: BeaconSecret = BeaconSecret::from_bytes(*b"lantern notification beacons v1!");

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Secret and identity behind a PSK identity string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskEntry {
    pub secret: BeaconSecret,
    /// The peer the identity belongs to. `None` for shared identities.
    pub public_key: Option<PublicKey>,
}

/// Maps PSK identities presented by inbound connections to their secrets.
pub trait PskResolver: Send + Sync {
    fn resolve(&self, identity: &str) -> Option<PskEntry>;
}

/// Native radio bridge.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start serving `router` to peers, authenticating with `psk`.
    async fn start(&self, router: Router, psk: Arc<dyn PskResolver>) -> TransportResult<()>;

    /// Tear everything down.
    async fn stop(&self) -> TransportResult<()>;

    /// Start reporting nearby peers.
    async fn start_listening_for_advertisements(&self) -> TransportResult<()>;

    /// Stop reporting nearby peers.
    async fn stop_listening_for_advertisements(&self) -> TransportResult<()>;

    /// Re-advertise so peers notice our beacon state changed.
    async fn start_update_advertising_and_listening(&self) -> TransportResult<()>;

    /// Stop advertising and drop inbound non-IP connections.
    async fn stop_advertising_and_listening(&self) -> TransportResult<()>;

    /// Peer availability events.
    fn subscribe_peer_availability(&self) -> broadcast::Receiver<PeerAvailability>;
}
