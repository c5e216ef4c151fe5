//! Lantern node - wires the notification server and client to a transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lantern_beacon::{KeyPair, PublicKey, ONE_DAY};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ip::{IpTransport, DEFAULT_ANNOUNCE_INTERVAL};
use crate::notification::fetch::DEFAULT_FETCH_TIMEOUT;
use crate::notification::{
    HttpBeaconFetcher, NotificationClient, NotificationServer, DEFAULT_BEACON_TTL,
};
use crate::transport::Transport;

/// Node configuration.
#[derive(Clone)]
pub struct NodeConfig {
    /// Beacon HTTP listen address
    pub http_addr: SocketAddr,

    /// Statically known IP peers
    pub peers: Vec<SocketAddr>,

    /// Lifetime of published beacons
    pub beacon_ttl: Duration,

    /// Interval between static peer announcements
    pub announce_interval: Duration,

    /// Peers to publish beacons for
    pub notify: Vec<PublicKey>,

    /// Senders whose beacons we accept; empty accepts anyone
    pub address_book: Vec<PublicKey>,

    /// Device secret key; a fresh one is generated when absent
    pub secret_key: Option<[u8; 32]>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8484)),
            peers: Vec::new(),
            beacon_ttl: DEFAULT_BEACON_TTL,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            notify: Vec::new(),
            address_book: Vec::new(),
            secret_key: None,
        }
    }
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("http_addr", &self.http_addr)
            .field("peers", &self.peers)
            .field("beacon_ttl", &self.beacon_ttl)
            .field("announce_interval", &self.announce_interval)
            .field("notify", &self.notify)
            .field("address_book", &self.address_book)
            .field("secret_key", &self.secret_key.map(|_| ".."))
            .finish()
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Create config from any variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let http_addr = match var("LANTERN_HTTP_ADDR") {
            Some(s) => s
                .parse()
                .map_err(|e| Error::Config(format!("LANTERN_HTTP_ADDR {:?}: {}", s, e)))?,
            None => defaults.http_addr,
        };

        let peers = list(var("LANTERN_PEERS"))
            .map(|p| {
                p.parse()
                    .map_err(|e| Error::Config(format!("LANTERN_PEERS entry {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<SocketAddr>>>()?;

        let beacon_ttl = match var("LANTERN_BEACON_TTL_SECS") {
            Some(s) => {
                let ttl = Duration::from_secs(secs("LANTERN_BEACON_TTL_SECS", &s)?);
                if ttl.is_zero() || ttl > ONE_DAY {
                    return Err(Error::Config(format!(
                        "LANTERN_BEACON_TTL_SECS must be between 1 and {}",
                        ONE_DAY.as_secs()
                    )));
                }
                ttl
            }
            None => defaults.beacon_ttl,
        };

        let announce_interval = match var("LANTERN_ANNOUNCE_SECS") {
            Some(s) => {
                let interval = Duration::from_secs(secs("LANTERN_ANNOUNCE_SECS", &s)?);
                if interval.is_zero() {
                    return Err(Error::Config("LANTERN_ANNOUNCE_SECS must be positive".into()));
                }
                interval
            }
            None => defaults.announce_interval,
        };

        let notify = keys("LANTERN_NOTIFY", var("LANTERN_NOTIFY"))?;
        let address_book = keys("LANTERN_ADDRESS_BOOK", var("LANTERN_ADDRESS_BOOK"))?;

        let secret_key = var("LANTERN_SECRET_KEY")
            .map(|s| {
                let bytes = hex::decode(s.trim())
                    .map_err(|e| Error::Config(format!("LANTERN_SECRET_KEY: {}", e)))?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| Error::Config("LANTERN_SECRET_KEY must be 32 bytes".into()))
            })
            .transpose()?;

        Ok(Self {
            http_addr,
            peers,
            beacon_ttl,
            announce_interval,
            notify,
            address_book,
            secret_key,
        })
    }
}

fn list(value: Option<String>) -> impl Iterator<Item = String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .into_iter()
}

fn secs(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{} {:?}: {}", name, value, e)))
}

fn keys(name: &str, value: Option<String>) -> Result<Vec<PublicKey>> {
    list(value)
        .map(|k| {
            let bytes = hex::decode(&k).map_err(|e| Error::Config(format!("{} entry {:?}: {}", name, k, e)))?;
            PublicKey::from_bytes(&bytes).map_err(|e| Error::Config(format!("{} entry {:?}: {}", name, k, e)))
        })
        .collect()
}

/// A Lantern node on an IP network.
pub struct LanternNode {
    config: NodeConfig,
    keys: Arc<KeyPair>,
    transport: Arc<IpTransport>,
    server: NotificationServer<IpTransport>,
    client: NotificationClient<IpTransport, HttpBeaconFetcher>,
}

impl LanternNode {
    /// Create a node. Must be called inside a Tokio runtime.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let keys = Arc::new(match &config.secret_key {
            Some(secret) => KeyPair::from_secret_bytes(secret),
            None => KeyPair::generate(),
        });
        let transport = Arc::new(IpTransport::new(
            config.http_addr,
            config.peers.clone(),
            config.announce_interval,
        ));
        let fetcher = Arc::new(HttpBeaconFetcher::new(DEFAULT_FETCH_TIMEOUT)?);
        let server = NotificationServer::with_ttl(Arc::clone(&transport), Arc::clone(&keys), config.beacon_ttl);
        let client = NotificationClient::new(Arc::clone(&transport), fetcher, Arc::clone(&keys));

        Ok(Self {
            config,
            keys,
            transport,
            server,
            client,
        })
    }

    /// The device key pair.
    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn server(&self) -> &NotificationServer<IpTransport> {
        &self.server
    }

    pub fn client(&self) -> &NotificationClient<IpTransport, HttpBeaconFetcher> {
        &self.client
    }

    pub fn transport(&self) -> &Arc<IpTransport> {
        &self.transport
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        info!("Lantern node starting");
        info!("  Key: {}", self.keys.public_key());
        info!("  HTTP: {}", self.config.http_addr);
        info!("  Peers: {}", self.config.peers.len());

        let mut events = self.client.subscribe();
        self.server.start(&self.config.notify).await?;
        self.client.start(&self.config.address_book).await?;

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => info!(
                        peer = %event.peer,
                        address = %format!("{}:{}", event.host_address, event.port_number),
                        sender = %event.sender,
                        psk_identity = %event.psk_identity,
                        "Peer has data for us"
                    ),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Dropped notifications"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Lantern node shutting down");
        self.client.stop().await?;
        self.server.stop().await?;
        self.transport.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = NodeConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8484".parse().unwrap());
        assert!(config.peers.is_empty());
        assert_eq!(config.beacon_ttl, Duration::from_secs(3600));
        assert_eq!(config.announce_interval, Duration::from_secs(30));
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn parses_all_variables() {
        let peer_key = KeyPair::generate().public_key();
        let config = NodeConfig::from_vars(vars(&[
            ("LANTERN_HTTP_ADDR", "127.0.0.1:9000"),
            ("LANTERN_PEERS", "10.0.0.1:8484, 10.0.0.2:8484,"),
            ("LANTERN_BEACON_TTL_SECS", "120"),
            ("LANTERN_ANNOUNCE_SECS", "5"),
            ("LANTERN_NOTIFY", &peer_key.to_hex()),
            ("LANTERN_SECRET_KEY", &"11".repeat(32)),
        ]))
        .unwrap();

        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.beacon_ttl, Duration::from_secs(120));
        assert_eq!(config.announce_interval, Duration::from_secs(5));
        assert_eq!(config.notify, vec![peer_key]);
        assert_eq!(config.secret_key, Some([0x11; 32]));
    }

    #[test]
    fn debug_redacts_secret_key() {
        let config = NodeConfig::from_vars(vars(&[("LANTERN_SECRET_KEY", &"ab".repeat(32))])).unwrap();
        let printed = format!("{:?}", config);
        assert!(printed.contains("secret_key: Some(\"..\")"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn rejects_invalid_values() {
        for (name, value) in [
            ("LANTERN_HTTP_ADDR", "nowhere"),
            ("LANTERN_PEERS", "10.0.0.1"),
            ("LANTERN_BEACON_TTL_SECS", "0"),
            ("LANTERN_BEACON_TTL_SECS", "90000"),
            ("LANTERN_ANNOUNCE_SECS", "soon"),
            ("LANTERN_NOTIFY", "abcd"),
            ("LANTERN_SECRET_KEY", "00"),
        ] {
            let err = NodeConfig::from_vars(vars(&[(name, value)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}={}", name, value);
        }
    }
}
