//! Notification Server - publishes beacons addressed to chosen peers.
//!
//! Every mutation goes through the server's [`SerializedOperationQueue`], so
//! `start` and `stop` apply in call order and never interleave. The
//! published blob and its PSK secrets live in [`PublishedBeacons`], which the
//! HTTP handler and the transport's PSK lookup read concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use lantern_beacon::{generate, BeaconSet, KeyPair, PublicKey};
use lantern_protocols::SerializedOperationQueue;
use tracing::{debug, info, warn};

use crate::api::build_router;
use crate::error::{Error, Result};
use crate::transport::{PskEntry, PskResolver, Transport, BEACON_PSK_IDENTITY, BEACON_PSK_SECRET};

/// Default lifetime of a published beacon set.
pub const DEFAULT_BEACON_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
struct Published {
    blob: Option<Bytes>,
    /// Keyed by hex `PublicKeyHash` of the recipient.
    secrets: HashMap<String, PskEntry>,
}

/// The currently advertised beacon blob and its PSK secrets.
///
/// Both are swapped together, so readers never see a blob paired with
/// another blob's secrets.
#[derive(Clone, Default)]
pub struct PublishedBeacons {
    inner: Arc<RwLock<Published>>,
}

impl PublishedBeacons {
    /// The published blob, if any.
    pub fn blob(&self) -> Option<Bytes> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blob
            .clone()
    }

    /// Whether a blob is published.
    pub fn is_published(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .blob
            .is_some()
    }

    pub(crate) fn publish(&self, set: Option<BeaconSet>) {
        let next = match set {
            None => Published::default(),
            Some(set) => {
                let secrets = set
                    .secrets()
                    .iter()
                    .map(|r| {
                        (
                            r.recipient.hash().to_hex(),
                            PskEntry {
                                secret: r.secret.clone(),
                                public_key: Some(r.recipient),
                            },
                        )
                    })
                    .collect();
                Published {
                    blob: Some(Bytes::from(set.into_bytes())),
                    secrets,
                }
            }
        };
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl PskResolver for PublishedBeacons {
    fn resolve(&self, identity: &str) -> Option<PskEntry> {
        if identity == BEACON_PSK_IDENTITY {
            return Some(PskEntry {
                secret: BEACON_PSK_SECRET,
                public_key: None,
            });
        }
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .secrets
            .get(identity)
            .cloned()
    }
}

impl std::fmt::Debug for PublishedBeacons {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PublishedBeacons")
            .field("blob_len", &inner.blob.as_ref().map(Bytes::len))
            .field("recipients", &inner.secrets.len())
            .finish()
    }
}

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    /// Not advertising.
    Stopped,
    /// The first `start` is bringing the transport up.
    FirstStart,
    /// Advertising.
    Running,
}

struct Inner<T> {
    transport: Arc<T>,
    local: Arc<KeyPair>,
    ttl: Duration,
    published: PublishedBeacons,
    phase: Mutex<ServerPhase>,
    transport_started: Mutex<bool>,
}

/// Publishes notification beacons through a [`Transport`].
pub struct NotificationServer<T: Transport> {
    inner: Arc<Inner<T>>,
    queue: SerializedOperationQueue,
}

impl<T: Transport> NotificationServer<T> {
    /// Create a server. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<T>, local: Arc<KeyPair>) -> Self {
        Self::with_ttl(transport, local, DEFAULT_BEACON_TTL)
    }

    /// Create a server publishing beacons that live for `ttl`.
    pub fn with_ttl(transport: Arc<T>, local: Arc<KeyPair>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                local,
                ttl,
                published: PublishedBeacons::default(),
                phase: Mutex::new(ServerPhase::Stopped),
                transport_started: Mutex::new(false),
            }),
            queue: SerializedOperationQueue::new(),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ServerPhase {
        *self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What peers currently download.
    pub fn published(&self) -> &PublishedBeacons {
        &self.inner.published
    }

    /// Advertise beacons addressed to `recipients`, replacing whatever was
    /// advertised before. An empty list advertises nothing.
    pub async fn start(&self, recipients: &[PublicKey]) -> Result<()> {
        let recipients = recipients.to_vec();
        let inner = Arc::clone(&self.inner);
        self.queue
            .enqueue(move || async move { inner.start(recipients).await })
            .await
    }

    /// Like [`start`](Self::start), taking raw 32-byte keys.
    ///
    /// A malformed key fails with [`Error::InvalidArgument`] and leaves the
    /// advertised state untouched.
    pub async fn start_from_bytes<K: AsRef<[u8]>>(&self, recipients: &[K]) -> Result<()> {
        let raw: Vec<Vec<u8>> = recipients.iter().map(|k| k.as_ref().to_vec()).collect();
        let inner = Arc::clone(&self.inner);
        self.queue
            .enqueue(move || async move {
                let recipients = raw
                    .iter()
                    .map(|k| PublicKey::from_bytes(k))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::InvalidArgument(e.to_string()))?;
                inner.start(recipients).await
            })
            .await
    }

    /// Stop advertising and forget every published secret.
    pub async fn stop(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.queue
            .enqueue(move || async move { inner.stop().await })
            .await
    }
}

impl<T: Transport> Inner<T> {
    fn set_phase(&self, phase: ServerPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    async fn start(&self, recipients: Vec<PublicKey>) -> Result<()> {
        // Generate before touching anything so a failure leaves the old
        // state in place.
        let set = if recipients.is_empty() {
            None
        } else {
            Some(generate(&recipients, &self.local, self.ttl)?)
        };

        let first_start = !*self.transport_started.lock().unwrap_or_else(PoisonError::into_inner);
        if first_start {
            self.set_phase(ServerPhase::FirstStart);
            let router = build_router(self.published.clone());
            let psk: Arc<dyn PskResolver> = Arc::new(self.published.clone());
            if let Err(e) = self.transport.start(router, psk).await {
                warn!(error = %e, "Transport failed to start");
                self.set_phase(ServerPhase::Stopped);
                return Err(Error::Advertising(e));
            }
            *self.transport_started.lock().unwrap_or_else(PoisonError::into_inner) = true;
            debug!("Beacon router registered");
        }

        let had_beacons = self.published.is_published();
        let has_beacons = set.is_some();
        self.published.publish(set);
        self.set_phase(ServerPhase::Running);

        info!(recipients = recipients.len(), "Beacon set published");

        if had_beacons || has_beacons {
            self.transport
                .start_update_advertising_and_listening()
                .await
                .map_err(Error::Advertising)?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.published.publish(None);
        self.set_phase(ServerPhase::Stopped);
        info!("Beacon advertising stopped");
        self.transport
            .stop_advertising_and_listening()
            .await
            .map_err(Error::Stop)
    }
}

impl<T: Transport> std::fmt::Debug for NotificationServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationServer")
            .field("phase", &self.phase())
            .field("published", &self.inner.published)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::notification::testing::MockTransport;
    use lantern_beacon::parse;

    fn server() -> (NotificationServer<MockTransport>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let server = NotificationServer::new(Arc::clone(&transport), Arc::new(KeyPair::generate()));
        (server, transport)
    }

    #[tokio::test]
    async fn first_start_registers_router_once() {
        let (server, transport) = server();
        assert_eq!(server.phase(), ServerPhase::Stopped);

        server.start(&[]).await.unwrap();
        server.start(&[]).await.unwrap();
        server.stop().await.unwrap();
        server.start(&[]).await.unwrap();

        assert_eq!(transport.calls().starts, 1);
        assert_eq!(server.phase(), ServerPhase::Running);
    }

    #[tokio::test]
    async fn empty_to_empty_does_not_refresh() {
        let (server, transport) = server();
        server.start(&[]).await.unwrap();
        server.start(&[]).await.unwrap();
        assert_eq!(transport.calls().refreshes, 0);
    }

    #[tokio::test]
    async fn clearing_beacons_refreshes_once() {
        let (server, transport) = server();
        let peer = KeyPair::generate().public_key();

        server.start(&[peer]).await.unwrap();
        assert_eq!(transport.calls().refreshes, 1);

        server.start(&[]).await.unwrap();
        assert_eq!(transport.calls().refreshes, 2);
        assert!(server.published().blob().is_none());
    }

    #[tokio::test]
    async fn changing_key_set_refreshes() {
        let (server, transport) = server();
        server.start(&[KeyPair::generate().public_key()]).await.unwrap();
        server.start(&[KeyPair::generate().public_key()]).await.unwrap();
        assert_eq!(transport.calls().refreshes, 2);
    }

    #[tokio::test]
    async fn malformed_key_leaves_state_untouched() {
        let (server, transport) = server();
        let peer = KeyPair::generate();
        server.start(&[peer.public_key()]).await.unwrap();
        let before = server.published().blob().unwrap();

        let good = peer.public_key().as_bytes().to_vec();
        let err = server
            .start_from_bytes(&[good, vec![0u8; 31]])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(server.published().blob().unwrap(), before);
        assert_eq!(transport.calls().refreshes, 1);
    }

    #[tokio::test]
    async fn published_blob_addresses_recipients() {
        let (server, _transport) = server();
        let peer = KeyPair::generate();
        server.start_from_bytes(&[peer.public_key().as_bytes()]).await.unwrap();

        let blob = server.published().blob().unwrap();
        let parsed = parse(&blob, &peer).unwrap();
        assert!(parsed.matched);

        let identity = peer.public_key_hash().to_hex();
        let entry = server.published().resolve(&identity).unwrap();
        assert_eq!(Some(entry.secret), parsed.secret);
        assert_eq!(entry.public_key, Some(peer.public_key()));
    }

    #[tokio::test]
    async fn stop_clears_beacon_and_psk_secrets() {
        let (server, transport) = server();
        let peer = KeyPair::generate();
        server.start(&[peer.public_key()]).await.unwrap();
        server.stop().await.unwrap();

        assert!(server.published().blob().is_none());
        assert!(server.published().resolve(&peer.public_key_hash().to_hex()).is_none());
        assert!(server.published().resolve(BEACON_PSK_IDENTITY).is_some());
        assert_eq!(transport.calls().stops, 1);
        assert_eq!(server.phase(), ServerPhase::Stopped);
    }

    #[tokio::test]
    async fn transport_failures_are_propagated() {
        let (server, transport) = server();
        transport.fail_refresh(TransportError::new("radio off"));
        let err = server.start(&[KeyPair::generate().public_key()]).await.unwrap_err();
        assert!(matches!(err, Error::Advertising(_)));

        transport.fail_stop(TransportError::new("radio stuck"));
        let err = server.stop().await.unwrap_err();
        assert!(matches!(err, Error::Stop(_)));
    }

    #[tokio::test]
    async fn failed_first_start_is_retried() {
        let (server, transport) = server();
        transport.fail_start(TransportError::new("no listener"));
        assert!(matches!(server.start(&[]).await, Err(Error::Advertising(_))));
        assert_eq!(server.phase(), ServerPhase::Stopped);

        server.start(&[]).await.unwrap();
        assert_eq!(transport.calls().starts, 2);
        assert_eq!(server.phase(), ServerPhase::Running);
    }
}
