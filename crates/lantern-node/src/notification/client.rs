//! Notification Client - finds beacons addressed to us.
//!
//! The client listens to peer availability from the transport, downloads
//! each available peer's beacon blob and parses it with the local key. When
//! a peer turns out to have data for us it emits [`PeerAdvertisesDataForUs`],
//! once per distinct beacon.
//!
//! All per-peer bookkeeping is owned by a single event-loop task; `start`
//! and `stop` go through the client's [`SerializedOperationQueue`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use lantern_beacon::{parse, BeaconSecret, KeyPair, ParsedBeacon, PublicKey, PublicKeyHash};
use lantern_protocols::{
    ConnectionType, PeerAvailability, PeerIdentifier, QuitSignal, SerializedOperationQueue,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::notification::fetch::BeaconFetcher;
use crate::transport::Transport;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { event_capacity: 64 }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// A peer published a beacon addressed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAdvertisesDataForUs {
    pub peer: PeerIdentifier,
    pub host_address: String,
    pub port_number: u16,
    pub connection_type: ConnectionType,
    /// PSK secret for the data connection.
    pub secret: BeaconSecret,
    /// Who generated the beacon.
    pub sender: PublicKeyHash,
    /// PSK identity to present on the data connection.
    pub psk_identity: String,
}

struct Running {
    quit: QuitSignal,
    handle: JoinHandle<()>,
}

struct Inner<T, F> {
    transport: Arc<T>,
    fetcher: Arc<F>,
    local: Arc<KeyPair>,
    events: broadcast::Sender<PeerAdvertisesDataForUs>,
    running: Mutex<Option<Running>>,
}

/// Discovers beacons addressed to the local key.
pub struct NotificationClient<T: Transport, F: BeaconFetcher> {
    inner: Arc<Inner<T, F>>,
    queue: SerializedOperationQueue,
}

impl<T: Transport, F: BeaconFetcher> NotificationClient<T, F> {
    /// Create a client. Must be called inside a Tokio runtime.
    pub fn new(transport: Arc<T>, fetcher: Arc<F>, local: Arc<KeyPair>) -> Self {
        Self::with_config(transport, fetcher, local, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<T>,
        fetcher: Arc<F>,
        local: Arc<KeyPair>,
        config: ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                transport,
                fetcher,
                local,
                events,
                running: Mutex::new(None),
            }),
            queue: SerializedOperationQueue::new(),
        }
    }

    /// Subscribe to discovered notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerAdvertisesDataForUs> {
        self.inner.events.subscribe()
    }

    /// Whether the event loop is running.
    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Start discovering beacons from senders in `address_book`.
    ///
    /// An empty book accepts any sender. Calling `start` while running
    /// restarts discovery with fresh per-peer state.
    pub async fn start(&self, address_book: &[PublicKey]) -> Result<()> {
        let book: HashSet<PublicKeyHash> = address_book.iter().map(PublicKey::hash).collect();
        let inner = Arc::clone(&self.inner);
        self.queue
            .enqueue(move || async move { inner.start(book).await })
            .await
    }

    /// Stop discovery and forget every peer.
    pub async fn stop(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.queue
            .enqueue(move || async move { inner.stop().await })
            .await
    }
}

impl<T: Transport, F: BeaconFetcher> Inner<T, F> {
    async fn start(&self, book: HashSet<PublicKeyHash>) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            debug!("Restarting notification client");
            shut_down(previous).await;
        }

        // Subscribe first so nothing reported after listening starts is lost.
        let availability = self.transport.subscribe_peer_availability();
        self.transport.start_listening_for_advertisements().await?;

        let quit = QuitSignal::new();
        let event_loop = EventLoop::new(
            Arc::clone(&self.fetcher),
            Arc::clone(&self.local),
            book,
            self.events.clone(),
        );
        let handle = tokio::spawn(event_loop.run(availability, quit.clone()));
        *running = Some(Running { quit, handle });

        info!("Notification client started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(previous) = self.running.lock().await.take() {
            shut_down(previous).await;
        }
        info!("Notification client stopped");
        self.transport
            .stop_listening_for_advertisements()
            .await
            .map_err(Error::Stop)
    }
}

async fn shut_down(running: Running) {
    running.quit.raise();
    if let Err(e) = running.handle.await {
        warn!(error = %e, "Notification event loop ended abnormally");
    }
}

#[derive(Default)]
struct PeerState {
    fetch: Option<AbortHandle>,
    /// Bumped when the peer goes away; fetches from an older epoch are stale.
    epoch: u64,
    /// Newest availability seen while a fetch was in flight.
    pending: Option<PeerAvailability>,
    last_fetched: Option<u32>,
    last_emitted: Option<(BeaconSecret, SystemTime)>,
}

type FetchOutcome = (u64, PeerAvailability, Result<Option<ParsedBeacon>>);

struct EventLoop<F> {
    fetcher: Arc<F>,
    local: Arc<KeyPair>,
    psk_identity: String,
    book: HashSet<PublicKeyHash>,
    events: broadcast::Sender<PeerAdvertisesDataForUs>,
    peers: HashMap<String, PeerState>,
    fetches: JoinSet<FetchOutcome>,
}

impl<F: BeaconFetcher> EventLoop<F> {
    fn new(
        fetcher: Arc<F>,
        local: Arc<KeyPair>,
        book: HashSet<PublicKeyHash>,
        events: broadcast::Sender<PeerAdvertisesDataForUs>,
    ) -> Self {
        let psk_identity = local.public_key_hash().to_hex();
        Self {
            fetcher,
            local,
            psk_identity,
            book,
            events,
            peers: HashMap::new(),
            fetches: JoinSet::new(),
        }
    }

    async fn run(mut self, mut availability: broadcast::Receiver<PeerAvailability>, quit: QuitSignal) {
        loop {
            tokio::select! {
                _ = quit.wait() => break,
                event = availability.recv() => match event {
                    Ok(peer) => self.on_availability(peer),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Peer availability stream lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Peer availability stream closed");
                        break;
                    }
                },
                Some(joined) = self.fetches.join_next() => match joined {
                    Ok((epoch, peer, result)) => self.on_fetched(epoch, peer, result),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(error = %e, "Beacon fetch task failed"),
                },
            }
        }
        trace!(peers = self.peers.len(), "Notification event loop exiting");
    }

    fn on_availability(&mut self, peer: PeerAvailability) {
        if !peer.peer_available {
            if let Some(state) = self.peers.get_mut(peer.uuid()) {
                trace!(peer = %peer.peer_identifier, "Peer gone");
                state.pending = None;
                state.epoch += 1;
                if let Some(fetch) = state.fetch.take() {
                    fetch.abort();
                }
            }
            return;
        }

        let state = self.peers.entry(peer.uuid().to_string()).or_default();
        if state.last_fetched.is_some_and(|last| peer.generation() <= last) {
            trace!(peer = %peer.peer_identifier, "Generation already fetched");
            return;
        }
        if state.fetch.is_some() {
            let newer = state
                .pending
                .as_ref()
                .map_or(true, |p| peer.generation() > p.generation());
            if newer {
                state.pending = Some(peer);
            }
            return;
        }

        let epoch = state.epoch;
        let fetcher = Arc::clone(&self.fetcher);
        let local = Arc::clone(&self.local);
        state.fetch = Some(self.fetches.spawn(async move {
            let result = fetch_and_parse(fetcher.as_ref(), &local, &peer).await;
            (epoch, peer, result)
        }));
    }

    fn on_fetched(
        &mut self,
        epoch: u64,
        peer: PeerAvailability,
        result: Result<Option<ParsedBeacon>>,
    ) {
        let Some(state) = self.peers.get_mut(peer.uuid()) else {
            return;
        };
        if state.epoch != epoch {
            // Finished before the abort landed.
            trace!(peer = %peer.peer_identifier, "Discarding fetch for departed peer");
            return;
        }
        state.fetch = None;

        match result {
            Ok(parsed) => {
                state.last_fetched = Some(
                    state
                        .last_fetched
                        .map_or(peer.generation(), |last| last.max(peer.generation())),
                );
                if let Some(event) = Self::notification(&self.book, &self.psk_identity, &peer, parsed) {
                    let key = (event.notification.secret.clone(), event.expires_at);
                    if state.last_emitted.as_ref() != Some(&key) {
                        state.last_emitted = Some(key);
                        info!(peer = %peer.peer_identifier, sender = %event.notification.sender, "Peer has data for us");
                        // No subscribers is fine.
                        let _ = self.events.send(event.notification);
                    } else {
                        trace!(peer = %peer.peer_identifier, "Beacon unchanged");
                    }
                }
            }
            Err(e) => {
                warn!(peer = %peer.peer_identifier, error = %e, "Beacon fetch failed");
            }
        }

        if let Some(next) = state.pending.take() {
            self.on_availability(next);
        }
    }

    fn notification(
        book: &HashSet<PublicKeyHash>,
        psk_identity: &str,
        peer: &PeerAvailability,
        parsed: Option<ParsedBeacon>,
    ) -> Option<Emitted> {
        let parsed = parsed?;
        if !parsed.matched {
            return None;
        }
        if parsed.expired {
            debug!(peer = %peer.peer_identifier, "Ignoring expired beacon");
            return None;
        }
        let sender = parsed.sender?;
        if !book.is_empty() && !book.contains(&sender) {
            debug!(peer = %peer.peer_identifier, %sender, "Beacon from sender outside address book");
            return None;
        }
        let secret = parsed.secret?;
        Some(Emitted {
            expires_at: parsed.expires_at,
            notification: PeerAdvertisesDataForUs {
                peer: peer.peer_identifier.clone(),
                host_address: peer.host_address.clone(),
                port_number: peer.port_number,
                connection_type: peer.connection_type,
                secret,
                sender,
                psk_identity: psk_identity.to_string(),
            },
        })
    }
}

struct Emitted {
    expires_at: SystemTime,
    notification: PeerAdvertisesDataForUs,
}

async fn fetch_and_parse<F: BeaconFetcher>(
    fetcher: &F,
    local: &KeyPair,
    peer: &PeerAvailability,
) -> Result<Option<ParsedBeacon>> {
    let Some(blob) = fetcher.fetch(peer).await? else {
        return Ok(None);
    };
    Ok(Some(parse(&blob, local)?))
}

impl<T: Transport, F: BeaconFetcher> std::fmt::Debug for NotificationClient<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationClient")
            .field("subscribers", &self.inner.events.receiver_count())
            .finish_non_exhaustive()
    }
}
