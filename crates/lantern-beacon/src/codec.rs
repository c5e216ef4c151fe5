//! Beacon generation and parsing.
//!
//! # Wire Format
//!
//! ```text
//! preamble := ephemeral_public_key[32] || expiration_unix_millis[u64 BE]
//! record   := tag[16] || nonce[12] || sealed(sender_hash[16] || secret[32])[64]
//! blob     := preamble || record*
//! ```
//!
//! One ephemeral key is generated per beacon set. For every recipient the
//! generator runs X25519 between the ephemeral key and the recipient key and
//! derives two keys from the shared secret and the preamble:
//!
//! - a *tag key*, used to compute a 16-byte tag over the recipient's own
//!   public key. Only the recipient can recompute it, so it can find its
//!   record without trial decryption;
//! - a *payload key*, used to seal the sender's key hash and a fresh random
//!   secret with ChaCha20-Poly1305 (preamble as associated data).
//!
//! Records are shuffled; receivers never rely on their order.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::RngCore;
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::keys::{KeyPair, PublicKey, PublicKeyHash, PUBLIC_KEY_HASH_LEN, PUBLIC_KEY_LEN};

/// Longest allowed beacon lifetime.
pub const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Length of a beacon secret.
pub const SECRET_LEN: usize = 32;

/// Length of the shared preamble.
pub const PREAMBLE_LEN: usize = PUBLIC_KEY_LEN + 8;

const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const PAYLOAD_LEN: usize = PUBLIC_KEY_HASH_LEN + SECRET_LEN;

/// Length of a single addressed record.
pub const RECORD_LEN: usize = TAG_LEN + NONCE_LEN + PAYLOAD_LEN + AEAD_TAG_LEN;

const TAG_CONTEXT: &str = "lantern 2024 notification beacon tag v1";
const PAYLOAD_CONTEXT: &str = "lantern 2024 notification beacon payload v1";

/// Random secret carried inside a beacon record.
///
/// The recipient uses it as the pre-shared key for the follow-up connection.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BeaconSecret([u8; SECRET_LEN]);

impl BeaconSecret {
    /// Generate a fresh secret.
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing bytes.
    pub const fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for BeaconSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BeaconSecret(..)")
    }
}

/// The secret generated for one recipient of a beacon set.
#[derive(Debug, Clone)]
pub struct RecipientSecret {
    /// Who the record is addressed to.
    pub recipient: PublicKey,
    /// The secret sealed into the record.
    pub secret: BeaconSecret,
}

/// An encoded beacon set, plus the secrets that went into it.
#[derive(Debug, Clone)]
pub struct BeaconSet {
    blob: Vec<u8>,
    secrets: Vec<RecipientSecret>,
    expires_at: SystemTime,
}

impl BeaconSet {
    /// The encoded blob, as served to peers.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    /// Consume into the encoded blob.
    pub fn into_bytes(self) -> Vec<u8> {
        self.blob
    }

    /// Per-recipient secrets, in the order recipients were given.
    pub fn secrets(&self) -> &[RecipientSecret] {
        &self.secrets
    }

    /// Number of addressed records.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// True when the set addresses nobody.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Shared expiration of every record.
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }
}

/// Result of parsing a received beacon blob against the local key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBeacon {
    /// Some record was addressed to the local key.
    pub matched: bool,
    /// Secret recovered from the matching record.
    pub secret: Option<BeaconSecret>,
    /// Key hash of the device that generated the beacon.
    pub sender: Option<PublicKeyHash>,
    /// The shared expiration has passed. Independent of `matched`.
    pub expired: bool,
    /// The shared expiration.
    pub expires_at: SystemTime,
}

/// Digest used as the peer-identity index.
pub fn create_public_key_hash(key: &PublicKey) -> PublicKeyHash {
    PublicKeyHash::of(key)
}

/// Generate a beacon set addressed to `recipients`, expiring `ttl` from now.
pub fn generate(recipients: &[PublicKey], local: &KeyPair, ttl: Duration) -> Result<BeaconSet> {
    generate_at(recipients, local, ttl, SystemTime::now())
}

/// Generate from raw recipient keys.
///
/// Every key is validated before anything is produced, so a single
/// malformed key rejects the whole call.
pub fn generate_from_bytes<K: AsRef<[u8]>>(
    recipients: &[K],
    local: &KeyPair,
    ttl: Duration,
) -> Result<BeaconSet> {
    let keys = recipients
        .iter()
        .map(|k| PublicKey::from_bytes(k.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    generate(&keys, local, ttl)
}

/// Generate a beacon set as of `now`.
pub fn generate_at(
    recipients: &[PublicKey],
    local: &KeyPair,
    ttl: Duration,
    now: SystemTime,
) -> Result<BeaconSet> {
    if ttl.is_zero() || ttl > ONE_DAY {
        return Err(Error::InvalidTtl(ttl));
    }

    let expiration = unix_millis(now).saturating_add(ttl.as_millis() as u64);
    let ephemeral = KeyPair::generate();

    let mut preamble = [0u8; PREAMBLE_LEN];
    preamble[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral.public_key().as_bytes());
    preamble[PUBLIC_KEY_LEN..].copy_from_slice(&expiration.to_be_bytes());

    let sender = local.public_key_hash();
    let mut records = Vec::with_capacity(recipients.len());
    let mut secrets = Vec::with_capacity(recipients.len());

    for recipient in recipients {
        let shared = ephemeral
            .agree(recipient)
            .ok_or_else(|| Error::InvalidKey(format!("degenerate key agreement with {}", recipient)))?;
        let keys = RecordKeys::derive(&shared, &preamble);
        let secret = BeaconSecret::random();

        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..PUBLIC_KEY_HASH_LEN].copy_from_slice(sender.as_bytes());
        payload[PUBLIC_KEY_HASH_LEN..].copy_from_slice(secret.as_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.payload_key));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &payload,
                    aad: &preamble,
                },
            )
            .map_err(|_| Error::Encryption)?;
        payload.zeroize();

        let mut record = Vec::with_capacity(RECORD_LEN);
        record.extend_from_slice(&keys.tag_for(recipient));
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&sealed);
        debug_assert_eq!(record.len(), RECORD_LEN);

        records.push(record);
        secrets.push(RecipientSecret {
            recipient: *recipient,
            secret,
        });
    }

    records.shuffle(&mut OsRng);

    let mut blob = Vec::with_capacity(PREAMBLE_LEN + records.len() * RECORD_LEN);
    blob.extend_from_slice(&preamble);
    for record in &records {
        blob.extend_from_slice(record);
    }

    debug!(
        recipients = recipients.len(),
        ttl_ms = ttl.as_millis() as u64,
        bytes = blob.len(),
        "Generated beacon set"
    );

    Ok(BeaconSet {
        blob,
        secrets,
        expires_at: UNIX_EPOCH + Duration::from_millis(expiration),
    })
}

/// Parse a received blob against the local key.
pub fn parse(blob: &[u8], local: &KeyPair) -> Result<ParsedBeacon> {
    parse_at(blob, local, SystemTime::now())
}

/// Parse a received blob as of `now`.
pub fn parse_at(blob: &[u8], local: &KeyPair, now: SystemTime) -> Result<ParsedBeacon> {
    if blob.len() < PREAMBLE_LEN {
        return Err(Error::MalformedBeacon(format!(
            "blob of {} bytes is shorter than the preamble",
            blob.len()
        )));
    }
    let (preamble, records) = blob.split_at(PREAMBLE_LEN);
    if records.len() % RECORD_LEN != 0 {
        return Err(Error::MalformedBeacon(format!(
            "{} trailing bytes do not form whole records",
            records.len()
        )));
    }

    let ephemeral = PublicKey::from_bytes(&preamble[..PUBLIC_KEY_LEN])
        .map_err(|e| Error::MalformedBeacon(format!("ephemeral key: {}", e)))?;
    let mut expiration_bytes = [0u8; 8];
    expiration_bytes.copy_from_slice(&preamble[PUBLIC_KEY_LEN..]);
    let expiration = u64::from_be_bytes(expiration_bytes);

    let expires_at = UNIX_EPOCH + Duration::from_millis(expiration);
    let expired = unix_millis(now) > expiration;

    let shared = local
        .agree(&ephemeral)
        .ok_or_else(|| Error::MalformedBeacon("degenerate ephemeral key".to_string()))?;
    let keys = RecordKeys::derive(&shared, preamble);
    let own_tag = keys.tag_for(&local.public_key());

    for record in records.chunks_exact(RECORD_LEN) {
        let (tag, rest) = record.split_at(TAG_LEN);
        if tag != own_tag {
            continue;
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.payload_key));
        let mut payload = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: preamble,
                },
            )
            .map_err(|_| Error::MalformedBeacon("record failed authentication".to_string()))?;

        let mut sender = [0u8; PUBLIC_KEY_HASH_LEN];
        sender.copy_from_slice(&payload[..PUBLIC_KEY_HASH_LEN]);
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&payload[PUBLIC_KEY_HASH_LEN..PAYLOAD_LEN]);
        payload.zeroize();

        trace!(expired, "Beacon addressed to local key");
        return Ok(ParsedBeacon {
            matched: true,
            secret: Some(BeaconSecret(secret)),
            sender: Some(PublicKeyHash::from_bytes(sender)),
            expired,
            expires_at,
        });
    }

    Ok(ParsedBeacon {
        matched: false,
        secret: None,
        sender: None,
        expired,
        expires_at,
    })
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct RecordKeys {
    tag_key: [u8; 32],
    payload_key: [u8; 32],
}

impl RecordKeys {
    fn derive(shared: &[u8; 32], preamble: &[u8]) -> Self {
        let mut material = Vec::with_capacity(shared.len() + preamble.len());
        material.extend_from_slice(shared);
        material.extend_from_slice(preamble);
        let keys = Self {
            tag_key: blake3::derive_key(TAG_CONTEXT, &material),
            payload_key: blake3::derive_key(PAYLOAD_CONTEXT, &material),
        };
        material.zeroize();
        keys
    }

    fn tag_for(&self, recipient: &PublicKey) -> [u8; TAG_LEN] {
        let hash = blake3::keyed_hash(&self.tag_key, recipient.as_bytes());
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&hash.as_bytes()[..TAG_LEN]);
        tag
    }
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
