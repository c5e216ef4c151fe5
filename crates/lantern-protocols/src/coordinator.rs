//! Connection Round Coordinator - many-to-many connection validation.
//!
//! Every participant in a fixed set proves, once per round, that it can open
//! a connection to every other participant and exchange a round-tagged
//! message with it. A round is symmetric: the local peer runs a client role
//! (dialing every other participant as it becomes available) and a server
//! role (accepting and validating their inbound attempts) at the same time,
//! and the round only completes once both are done.
//!
//! # Round lifecycle
//!
//! ```text
//!              ┌─ client role ─ dial ─→ interpret ─┬─ Success  → succeeded
//!  run_round ──┤                                   ├─ NonFatal → retry after delay
//!              │                                   └─ Fatal    → raise quit, reject
//!              └─ server role ─ accept ─→ validate ─→ respond ─→ validated
//! ```
//!
//! Each round owns a fresh [`QuitSignal`]. Retry timers and in-flight
//! attempts are registered with it, so raising it tears the round down.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::peer::PeerAvailability;
use crate::quit::{QuitSignal, TimerOutcome};
use crate::round::{round_code, RoundContext, RoundMessage, RoundOutcome, DEFAULT_PAYLOAD_LEN};

/// Round configuration.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Limit on a single connect + exchange, in either role.
    pub exchange_timeout: Duration,

    /// Wait before re-dialing a peer after a non-fatal failure.
    pub retry_delay: Duration,

    /// Length of the bulk payload carried by every message.
    pub payload_len: usize,

    /// Limit on a whole round. `None` waits indefinitely.
    pub round_timeout: Option<Duration>,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
            payload_len: DEFAULT_PAYLOAD_LEN,
            round_timeout: None,
        }
    }
}

impl RoundConfig {
    /// Short timeouts for local networks and tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(50),
            payload_len: 256,
            round_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Set the per-exchange timeout.
    #[must_use]
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set the retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the bulk payload length.
    #[must_use]
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    /// Set the whole-round timeout.
    #[must_use]
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }

    /// Disable the whole-round timeout.
    #[must_use]
    pub fn without_round_timeout(mut self) -> Self {
        self.round_timeout = None;
        self
    }
}

/// What a completed round established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// Round number.
    pub round: u32,
    /// Participants our client role exchanged with successfully.
    pub succeeded: BTreeSet<Uuid>,
    /// Participants our server role validated.
    pub validated: BTreeSet<Uuid>,
}

/// Drives validation rounds for one local participant.
pub struct ConnectionRoundCoordinator {
    context: Arc<RoundContext>,
    config: RoundConfig,
    listener: TcpListener,
    /// Latest availability per transport uuid, carried across rounds.
    known: HashMap<String, PeerAvailability>,
}

impl ConnectionRoundCoordinator {
    /// Bind the round listener and create a coordinator.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        local: Uuid,
        participants: impl IntoIterator<Item = Uuid>,
        config: RoundConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, local, participants, config))
    }

    /// Create a coordinator on an already bound listener.
    pub fn new(
        listener: TcpListener,
        local: Uuid,
        participants: impl IntoIterator<Item = Uuid>,
        config: RoundConfig,
    ) -> Self {
        let context = RoundContext::new(local, participants, config.payload_len);
        Self {
            context: Arc::new(context),
            config,
            listener,
            known: HashMap::new(),
        }
    }

    /// Address of the round listener.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wire format and validation rules in use.
    pub fn context(&self) -> &RoundContext {
        &self.context
    }

    /// Run one round to completion.
    ///
    /// Peers already seen in earlier rounds are dialed straight away; new
    /// ones are picked up from `availability`.
    pub async fn run_round(
        &mut self,
        round: u32,
        availability: &mut broadcast::Receiver<PeerAvailability>,
    ) -> Result<RoundReport> {
        let code = round_code(round)?;
        let quit = QuitSignal::new();
        let Self {
            context,
            config,
            listener,
            known,
        } = self;
        let (context, config, listener) = (&*context, &*config, &*listener);

        info!(
            round,
            local = %context.local(),
            participants = context.participants().len(),
            "Starting round"
        );

        let roles = async {
            tokio::try_join!(
                client_role(context, config, code, &quit, known, availability),
                server_role(context, config, code, listener),
            )
        };

        let result = match config.round_timeout {
            Some(limit) => {
                let timer = quit.timeout(limit)?;
                tokio::select! {
                    biased;
                    result = roles => result,
                    outcome = timer => match outcome {
                        TimerOutcome::Elapsed => Err(Error::Timeout(limit)),
                        TimerOutcome::Cancelled => Err(Error::Cancelled),
                    },
                }
            }
            None => roles.await,
        };

        // Tears down stragglers either way.
        quit.raise();

        match result {
            Ok((succeeded, validated)) => {
                info!(round, "Round complete");
                Ok(RoundReport {
                    round,
                    succeeded,
                    validated,
                })
            }
            Err(e) => {
                warn!(round, error = %e, "Round failed");
                Err(e)
            }
        }
    }

    /// Run rounds `0..rounds` back to back, stopping at the first failure.
    pub async fn run_rounds(
        &mut self,
        rounds: u32,
        availability: &mut broadcast::Receiver<PeerAvailability>,
    ) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::with_capacity(rounds as usize);
        for round in 0..rounds {
            reports.push(self.run_round(round, availability).await?);
        }
        Ok(reports)
    }
}

impl std::fmt::Debug for ConnectionRoundCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRoundCoordinator")
            .field("local", &self.context.local())
            .field("listener", &self.listener.local_addr().ok())
            .field("known", &self.known.len())
            .finish()
    }
}

/// Abort handles of the client role's live attempts, aborted together when
/// the round's quit signal is raised.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<Vec<AbortHandle>>>);

impl InFlight {
    fn track(&self, handle: AbortHandle) {
        let mut handles = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn abort_all(&self) {
        let mut handles = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in handles.drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Dial every other participant until each has answered `Success`.
async fn client_role(
    context: &Arc<RoundContext>,
    config: &RoundConfig,
    code: u8,
    quit: &QuitSignal,
    known: &mut HashMap<String, PeerAvailability>,
    availability: &mut broadcast::Receiver<PeerAvailability>,
) -> Result<BTreeSet<Uuid>> {
    let others = context.others();
    // Transport uuids with an attempt in flight or already succeeded.
    let mut resolving: HashSet<String> = HashSet::new();
    let mut succeeded: BTreeSet<Uuid> = BTreeSet::new();
    let mut attempts: JoinSet<(String, Result<Uuid>)> = JoinSet::new();
    let mut retries: JoinSet<(String, TimerOutcome)> = JoinSet::new();
    let mut stream_open = true;

    let in_flight = InFlight::default();
    {
        let in_flight = in_flight.clone();
        quit.on_raise(move || in_flight.abort_all())?;
    }

    let dial = |peer: &PeerAvailability,
                resolving: &mut HashSet<String>,
                attempts: &mut JoinSet<(String, Result<Uuid>)>|
     -> Result<()> {
        if !peer.peer_available || !resolving.insert(peer.uuid().to_string()) {
            return Ok(());
        }
        trace!(peer = %peer.peer_identifier, address = %peer.address(), "Dialing");
        let context = Arc::clone(context);
        let transport_uuid = peer.uuid().to_string();
        let address = peer.address();
        let timeout = config.exchange_timeout;
        let handle = attempts.spawn(async move {
            let result = exchange(&context, &address, code, timeout).await;
            (transport_uuid, result)
        });
        in_flight.track(handle);
        Ok(())
    };

    for peer in known.values() {
        dial(peer, &mut resolving, &mut attempts)?;
    }

    while !others.is_subset(&succeeded) {
        tokio::select! {
            event = availability.recv(), if stream_open => match event {
                Ok(peer) => {
                    dial(&peer, &mut resolving, &mut attempts)?;
                    known.insert(peer.uuid().to_string(), peer);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Peer availability stream lagged");
                }
                Err(RecvError::Closed) => {
                    debug!("Peer availability stream closed");
                    stream_open = false;
                }
            },
            Some(joined) = attempts.join_next() => {
                let (transport_uuid, result) = match joined {
                    Ok(finished) => finished,
                    Err(e) => {
                        warn!(error = %e, "Connection attempt task failed");
                        continue;
                    }
                };
                match result {
                    Ok(participant) => {
                        debug!(peer = %transport_uuid, %participant, "Exchange succeeded");
                        succeeded.insert(participant);
                    }
                    Err(e) if e.is_fatal() => {
                        warn!(peer = %transport_uuid, error = %e, "Fatal exchange failure, aborting round");
                        quit.raise();
                        return Err(e);
                    }
                    Err(e) => {
                        debug!(peer = %transport_uuid, error = %e, "Exchange failed, will retry");
                        resolving.remove(&transport_uuid);
                        let timer = quit.timeout(config.retry_delay)?;
                        retries.spawn(async move { (transport_uuid, timer.await) });
                    }
                }
            },
            Some(joined) = retries.join_next() => {
                if let Ok((transport_uuid, TimerOutcome::Elapsed)) = joined {
                    if let Some(peer) = known.get(&transport_uuid) {
                        dial(peer, &mut resolving, &mut attempts)?;
                    }
                }
            },
            else => {
                return Err(Error::Fatal(
                    "peer availability stream closed before the round completed".into(),
                ));
            }
        }
    }

    Ok(succeeded)
}

/// One client-side connect + exchange.
async fn exchange(context: &RoundContext, address: &str, code: u8, timeout: Duration) -> Result<Uuid> {
    let attempt = async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(&context.request(code).encode()).await?;

        let mut buf = vec![0u8; context.message_len()];
        stream.read_exact(&mut buf).await?;
        let response = RoundMessage::decode(&buf, context.payload().len())?;
        let responder = context.interpret_response(&response)?;

        stream.shutdown().await?;
        Ok::<_, Error>(responder)
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .unwrap_or(Err(Error::Timeout(timeout)))
}

/// Accept and validate inbound attempts until every other participant has
/// been validated.
async fn server_role(
    context: &Arc<RoundContext>,
    config: &RoundConfig,
    code: u8,
    listener: &TcpListener,
) -> Result<BTreeSet<Uuid>> {
    let others = context.others();
    let mut validated: BTreeSet<Uuid> = BTreeSet::new();
    let mut sessions: JoinSet<Result<Option<Uuid>>> = JoinSet::new();

    while !others.is_subset(&validated) {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!(%remote, "Accepted round connection");
                    let context = Arc::clone(context);
                    let timeout = config.exchange_timeout;
                    sessions.spawn(async move { serve(&context, stream, code, timeout).await });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            Some(joined) = sessions.join_next() => match joined {
                Ok(Ok(Some(peer))) => {
                    debug!(%peer, "Validated inbound peer");
                    validated.insert(peer);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(error = %e, "Inbound exchange failed"),
                Err(e) => warn!(error = %e, "Inbound session task failed"),
            },
        }
    }

    Ok(validated)
}

/// Serve one inbound attempt. Returns the peer on `Success`.
async fn serve(context: &RoundContext, mut stream: TcpStream, code: u8, timeout: Duration) -> Result<Option<Uuid>> {
    let session = async {
        let mut buf = vec![0u8; context.message_len()];
        stream.read_exact(&mut buf).await?;
        let request = RoundMessage::decode(&buf, context.payload().len())?;
        let outcome = context.validate_request(&request, code);

        stream.write_all(&context.response(outcome).encode()).await?;
        stream.shutdown().await?;

        if outcome != RoundOutcome::Success {
            debug!(peer = %request.uuid, %outcome, "Rejected inbound request");
            return Ok(None);
        }

        // Only count the peer once it has seen our answer and hung up.
        let mut rest = [0u8; 64];
        while stream.read(&mut rest).await? != 0 {}
        Ok::<_, Error>(Some(request.uuid))
    };

    tokio::time::timeout(timeout, session)
        .await
        .unwrap_or(Err(Error::Timeout(timeout)))
}
