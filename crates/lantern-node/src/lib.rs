//! Lantern Node - notification beacons for ad-hoc mesh peers
//!
//! A node tells specific peers it has data for them by publishing an
//! encrypted beacon blob, and watches nearby peers for beacons addressed to
//! itself.
//!
//! # Architecture
//!
//! - **Transport**: the radio bridge seam ([`Transport`]), plus a plain TCP
//!   implementation ([`IpTransport`])
//! - **API**: `GET /NotificationBeacons`, served through the transport
//! - **Notification**: [`NotificationServer`] publishes, [`NotificationClient`]
//!   discovers
//! - **Node**: environment configuration and the run loop
//!
//! # Example
//!
//! ```no_run
//! use lantern_node::{LanternNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = LanternNode::new(config)?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod error;
pub mod ip;
pub mod node;
pub mod notification;
pub mod transport;

pub use api::{build_router, BEACON_PATH};
pub use error::{Error, Result};
pub use ip::IpTransport;
pub use node::{LanternNode, NodeConfig};
pub use notification::{
    BeaconFetcher, ClientConfig, HttpBeaconFetcher, NotificationClient, NotificationServer,
    PeerAdvertisesDataForUs, PublishedBeacons, ServerPhase,
};
pub use transport::{PskEntry, PskResolver, Transport, TransportError, BEACON_PSK_IDENTITY};
