//! Plain TCP transport for IP networks.
//!
//! Serves the beacon router over HTTP and reports a static list of peers as
//! available, bumping their generation on every announcement tick so the
//! notification client re-checks them. There is no radio advertising to
//! refresh on IP, so those calls only log.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use lantern_protocols::{PeerAvailability, PeerIdentifier, QuitSignal};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::transport::{PskResolver, Transport, TransportError, TransportResult};

/// Default interval between static peer announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct IpState {
    server: Option<(QuitSignal, JoinHandle<()>)>,
    announcer: Option<(QuitSignal, JoinHandle<()>)>,
    local_addr: Option<SocketAddr>,
    psk: Option<Arc<dyn PskResolver>>,
}

/// TCP transport with statically configured peers.
pub struct IpTransport {
    http_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    announce_interval: Duration,
    availability: broadcast::Sender<PeerAvailability>,
    state: Mutex<IpState>,
}

impl IpTransport {
    pub fn new(http_addr: SocketAddr, peers: Vec<SocketAddr>, announce_interval: Duration) -> Self {
        let (availability, _) = broadcast::channel(256);
        Self {
            http_addr,
            peers,
            announce_interval,
            availability,
            state: Mutex::new(IpState::default()),
        }
    }

    /// Where the beacon router is being served, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.local_addr
    }

    /// Look up a PSK identity with the resolver handed to `start`.
    pub async fn resolve_psk(&self, identity: &str) -> Option<crate::transport::PskEntry> {
        let psk = self.state.lock().await.psk.clone()?;
        psk.resolve(identity)
    }
}

/// Peer identity of a static peer: its socket address.
fn static_peer(addr: SocketAddr, generation: u32) -> PeerAvailability {
    PeerAvailability::tcp(
        PeerIdentifier::new(addr.to_string(), generation),
        addr.ip().to_string(),
        addr.port(),
    )
}

async fn announce(
    peers: Vec<SocketAddr>,
    interval: Duration,
    availability: broadcast::Sender<PeerAvailability>,
    quit: QuitSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut generation: u32 = 0;
    loop {
        tokio::select! {
            _ = quit.wait() => break,
            _ = ticker.tick() => {
                for addr in &peers {
                    // Nobody listening yet is fine.
                    let _ = availability.send(static_peer(*addr, generation));
                }
                debug!(peers = peers.len(), generation, "Announced static peers");
                generation = generation.wrapping_add(1);
            }
        }
    }
}

async fn halt(task: Option<(QuitSignal, JoinHandle<()>)>) {
    if let Some((quit, handle)) = task {
        quit.raise();
        if let Err(e) = handle.await {
            error!(error = %e, "IP transport task ended abnormally");
        }
    }
}

#[async_trait]
impl Transport for IpTransport {
    async fn start(&self, router: Router, psk: Arc<dyn PskResolver>) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        if state.server.is_some() {
            return Err(TransportError::new("IP transport already started"));
        }

        let listener = TcpListener::bind(self.http_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Beacon HTTP server listening on {}", local_addr);

        let quit = QuitSignal::new();
        let shutdown = quit.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.wait().await });
            if let Err(e) = serve.await {
                error!("Beacon HTTP server error: {}", e);
            }
        });

        state.server = Some((quit, handle));
        state.local_addr = Some(local_addr);
        state.psk = Some(psk);
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        let (server, announcer) = {
            let mut state = self.state.lock().await;
            state.local_addr = None;
            state.psk = None;
            (state.server.take(), state.announcer.take())
        };
        halt(announcer).await;
        halt(server).await;
        info!("IP transport stopped");
        Ok(())
    }

    async fn start_listening_for_advertisements(&self) -> TransportResult<()> {
        let mut state = self.state.lock().await;
        if state.announcer.is_some() {
            return Ok(());
        }
        let quit = QuitSignal::new();
        let handle = tokio::spawn(announce(
            self.peers.clone(),
            self.announce_interval,
            self.availability.clone(),
            quit.clone(),
        ));
        state.announcer = Some((quit, handle));
        Ok(())
    }

    async fn stop_listening_for_advertisements(&self) -> TransportResult<()> {
        let announcer = self.state.lock().await.announcer.take();
        halt(announcer).await;
        Ok(())
    }

    async fn start_update_advertising_and_listening(&self) -> TransportResult<()> {
        debug!("Beacons served on demand over IP; nothing to re-advertise");
        Ok(())
    }

    async fn stop_advertising_and_listening(&self) -> TransportResult<()> {
        debug!("No non-IP connections to sever");
        Ok(())
    }

    fn subscribe_peer_availability(&self) -> broadcast::Receiver<PeerAvailability> {
        self.availability.subscribe()
    }
}

impl std::fmt::Debug for IpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpTransport")
            .field("http_addr", &self.http_addr)
            .field("peers", &self.peers)
            .field("announce_interval", &self.announce_interval)
            .finish_non_exhaustive()
    }
}
