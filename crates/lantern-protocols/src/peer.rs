//! Peer availability as reported by the radio transport.
//!
//! The transport layer owns these types; the notification and round layers
//! only read them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A transport-level peer identity.
///
/// `generation` increases every time the peer re-advertises under the same
/// uuid, so a newer generation means the peer's advertised state changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentifier {
    pub uuid: String,
    pub generation: u32,
}

impl PeerIdentifier {
    /// Create a new identifier.
    pub fn new(uuid: impl Into<String>, generation: u32) -> Self {
        Self {
            uuid: uuid.into(),
            generation,
        }
    }

    /// Same uuid, next generation.
    pub fn next_generation(&self) -> Self {
        Self {
            uuid: self.uuid.clone(),
            generation: self.generation.wrapping_add(1),
        }
    }
}

impl std::fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:x}", self.uuid, self.generation)
    }
}

impl FromStr for PeerIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uuid, generation) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidMessage(format!("peer identifier without generation: {}", s)))?;
        if uuid.is_empty() {
            return Err(Error::InvalidMessage(format!("peer identifier without uuid: {}", s)));
        }
        let generation = u32::from_str_radix(generation, 16)
            .map_err(|e| Error::InvalidMessage(format!("bad generation in {}: {}", s, e)))?;
        Ok(Self::new(uuid, generation))
    }
}

/// Which radio a peer was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    /// Apple multipeer connectivity framework.
    MultipeerConnectivity,
    /// Android Bluetooth.
    BluetoothAndroid,
    /// Plain TCP over an IP network.
    TcpNative,
}

impl ConnectionType {
    /// Whether connections of this type run over an IP network.
    pub fn is_ip(self) -> bool {
        matches!(self, ConnectionType::TcpNative)
    }
}

/// A peer-availability event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAvailability {
    pub peer_identifier: PeerIdentifier,
    pub peer_available: bool,
    pub host_address: String,
    pub port_number: u16,
    pub connection_type: ConnectionType,
}

impl PeerAvailability {
    /// An "available" event for a TCP peer.
    pub fn tcp(peer_identifier: PeerIdentifier, host_address: impl Into<String>, port_number: u16) -> Self {
        Self {
            peer_identifier,
            peer_available: true,
            host_address: host_address.into(),
            port_number,
            connection_type: ConnectionType::TcpNative,
        }
    }

    /// The same peer, reported as gone.
    pub fn unavailable(&self) -> Self {
        Self {
            peer_available: false,
            ..self.clone()
        }
    }

    /// Transport uuid of the peer.
    pub fn uuid(&self) -> &str {
        &self.peer_identifier.uuid
    }

    /// Generation of the advertisement.
    pub fn generation(&self) -> u32 {
        self.peer_identifier.generation
    }

    /// `host:port` for dialing.
    pub fn address(&self) -> String {
        if self.host_address.contains(':') {
            format!("[{}]:{}", self.host_address, self.port_number)
        } else {
            format!("{}:{}", self.host_address, self.port_number)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_formats_generation_as_hex() {
        let id = PeerIdentifier::new("peer-a", 26);
        assert_eq!(id.to_string(), "peer-a:1a");
    }

    #[test]
    fn identifier_parses_back() {
        let id = PeerIdentifier::new("3f2c-uuid:with-colon", 255);
        let parsed: PeerIdentifier = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn identifier_rejects_garbage() {
        assert!("no-generation".parse::<PeerIdentifier>().is_err());
        assert!("peer:zz".parse::<PeerIdentifier>().is_err());
        assert!(":1".parse::<PeerIdentifier>().is_err());
    }

    #[test]
    fn next_generation_keeps_uuid() {
        let id = PeerIdentifier::new("p", 1);
        let next = id.next_generation();
        assert_eq!(next.uuid, "p");
        assert_eq!(next.generation, 2);
    }

    #[test]
    fn availability_address() {
        let v4 = PeerAvailability::tcp(PeerIdentifier::new("p", 0), "127.0.0.1", 80);
        assert_eq!(v4.address(), "127.0.0.1:80");
        let v6 = PeerAvailability::tcp(PeerIdentifier::new("p", 0), "::1", 80);
        assert_eq!(v6.address(), "[::1]:80");
        assert!(!v4.unavailable().peer_available);
    }

    #[test]
    fn availability_json_matches_bridge_shape() {
        let event = PeerAvailability::tcp(PeerIdentifier::new("peer-a", 3), "10.0.0.7", 9001);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "peerIdentifier": { "uuid": "peer-a", "generation": 3 },
                "peerAvailable": true,
                "hostAddress": "10.0.0.7",
                "portNumber": 9001,
                "connectionType": "tcpNative",
            })
        );

        let back: PeerAvailability = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
