//! Device identity keys.
//!
//! Every device owns one Ed25519 [`KeyPair`] for its whole lifetime. Beacons
//! address peers by their Ed25519 public key; key agreement runs over the
//! Montgomery form of the same keys (X25519), so no second key pair is needed.

use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Length of an encoded public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a [`PublicKeyHash`].
pub const PUBLIC_KEY_HASH_LEN: usize = 16;

/// A peer's Ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse a public key from raw bytes.
    ///
    /// Rejects inputs of the wrong length, encodings that are not curve
    /// points, and small-order points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            ))
        })?;
        let key = VerifyingKey::from_bytes(&arr)
            .map_err(|_| Error::InvalidKey("not a valid curve point".to_string()))?;
        if key.is_weak() {
            return Err(Error::InvalidKey("small-order point".to_string()));
        }
        Ok(Self(key))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    /// Compact identity digest of this key.
    pub fn hash(&self) -> PublicKeyHash {
        PublicKeyHash::of(self)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    pub(crate) fn to_montgomery(self) -> MontgomeryPoint {
        self.0.to_montgomery()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

/// Fixed-length digest of a public key, used as the peer-identity index.
///
/// Truncated BLAKE3 of the raw key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyHash(pub [u8; PUBLIC_KEY_HASH_LEN]);

impl PublicKeyHash {
    /// Hash a public key.
    pub fn of(key: &PublicKey) -> Self {
        Self::from_key_bytes(key.as_bytes())
    }

    /// Hash raw public key bytes without validating them.
    pub fn from_key_bytes(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        let mut out = [0u8; PUBLIC_KEY_HASH_LEN];
        out.copy_from_slice(&hash.as_bytes()[..PUBLIC_KEY_HASH_LEN]);
        Self(out)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_HASH_LEN] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; PUBLIC_KEY_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for PublicKeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The local device's key pair.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a key pair from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Digest of the public half.
    pub fn public_key_hash(&self) -> PublicKeyHash {
        self.public_key().hash()
    }

    /// X25519 agreement between this key and a peer's public key.
    ///
    /// Returns `None` when the result is the identity, which only happens
    /// for keys that slipped past small-order validation.
    pub(crate) fn agree(&self, peer: &PublicKey) -> Option<[u8; 32]> {
        let scalar: Scalar = self.signing_key.to_scalar();
        let shared = peer.to_montgomery() * scalar;
        let bytes = shared.to_bytes();
        if bytes == [0u8; 32] {
            None
        } else {
            Some(bytes)
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_roundtrips_through_bytes() {
        let kp = KeyPair::generate();
        let pk = kp.public_key();
        let parsed = PublicKey::from_bytes(pk.as_bytes()).unwrap();
        assert_eq!(pk, parsed);
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        let err = PublicKey::from_bytes(&[7u8; 31]).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn public_key_rejects_small_order_point() {
        // Encoding of the identity point.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        assert!(PublicKey::from_bytes(&identity).is_err());
    }

    #[test]
    fn key_hash_deterministic() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public_key_hash(), PublicKeyHash::of(&kp.public_key()));
        assert_eq!(
            kp.public_key_hash(),
            PublicKeyHash::from_key_bytes(kp.public_key().as_bytes())
        );
    }

    #[test]
    fn key_hash_different_keys() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key_hash(), b.public_key_hash());
    }

    #[test]
    fn key_hash_hex_roundtrip() {
        let hash = KeyPair::generate().public_key_hash();
        assert_eq!(PublicKeyHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(PublicKeyHash::from_hex("abcd").is_err());
    }

    #[test]
    fn agreement_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let ab = alice.agree(&bob.public_key()).unwrap();
        let ba = bob.agree(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn restored_key_pair_matches() {
        let secret = [9u8; 32];
        let a = KeyPair::from_secret_bytes(&secret);
        let b = KeyPair::from_secret_bytes(&secret);
        assert_eq!(a.public_key(), b.public_key());
    }
}
