//! Lantern Beacons - Public-Key Addressed Notification Tokens
//!
//! A device that has data waiting for some peers publishes a *beacon set*:
//! an opaque blob any nearby device can download, but which only the
//! addressed peers can recognize and open.
//!
//! # Overview
//!
//! - [`KeyPair`] / [`PublicKey`]: long-lived Ed25519 device identity, reused
//!   for X25519 key agreement.
//! - [`PublicKeyHash`]: compact, deterministic identity index.
//! - [`codec`]: [`generate`] a [`BeaconSet`] for a list of recipients,
//!   [`parse`] a received blob against the local key.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use lantern_beacon::{generate, parse, KeyPair};
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! let set = generate(&[bob.public_key()], &alice, Duration::from_secs(60)).unwrap();
//! let parsed = parse(set.as_bytes(), &bob).unwrap();
//! assert!(parsed.matched);
//! assert_eq!(parsed.sender, Some(alice.public_key_hash()));
//! ```

pub mod codec;
pub mod error;
mod keys;

pub use codec::{
    create_public_key_hash, generate, generate_at, generate_from_bytes, parse, parse_at,
    BeaconSecret, BeaconSet, ParsedBeacon, RecipientSecret, ONE_DAY, PREAMBLE_LEN, RECORD_LEN,
    SECRET_LEN,
};
pub use error::{Error, Result};
pub use keys::{KeyPair, PublicKey, PublicKeyHash, PUBLIC_KEY_HASH_LEN, PUBLIC_KEY_LEN};
