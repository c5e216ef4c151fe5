//! Lantern Protocols - coordination primitives for mesh peers.
//!
//! This crate holds the pieces that keep concurrent peer work orderly:
//!
//! - [`SerializedOperationQueue`]: runs state mutations one at a time
//! - [`QuitSignal`]: one-shot cancellation for timers and in-flight work
//! - [`PeerAvailability`]: what the radio transport reports about peers
//! - [`ConnectionRoundCoordinator`]: round-based many-to-many connection
//!   validation over TCP
//!
//! # Example
//!
//! ```no_run
//! use lantern_protocols::{ConnectionRoundCoordinator, RoundConfig};
//! use tokio::sync::broadcast;
//! use uuid::Uuid;
//!
//! # async fn example() -> lantern_protocols::Result<()> {
//! let local = Uuid::new_v4();
//! let peers = [Uuid::new_v4(), Uuid::new_v4()];
//!
//! let mut coordinator =
//!     ConnectionRoundCoordinator::bind("0.0.0.0:0", local, peers, RoundConfig::default()).await?;
//!
//! // Fed by the transport layer.
//! let (_events, mut availability) = broadcast::channel(64);
//! let reports = coordinator.run_rounds(2, &mut availability).await?;
//! assert_eq!(reports.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod peer;
pub mod queue;
pub mod quit;
pub mod round;

pub use coordinator::{ConnectionRoundCoordinator, RoundConfig, RoundReport};
pub use error::{Error, Result};
pub use peer::{ConnectionType, PeerAvailability, PeerIdentifier};
pub use queue::{QueueError, SerializedOperationQueue, DEFAULT_QUEUE_CAPACITY};
pub use quit::{QuitError, QuitSignal, Timeout, TimerOutcome};
pub use round::{RoundContext, RoundMessage, RoundOutcome};
