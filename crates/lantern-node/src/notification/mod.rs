//! Notification beacons: publishing ours, discovering the ones meant for us.

pub mod client;
pub mod fetch;
pub mod server;

pub use client::{ClientConfig, NotificationClient, PeerAdvertisesDataForUs};
pub use fetch::{BeaconFetcher, HttpBeaconFetcher};
pub use server::{NotificationServer, PublishedBeacons, ServerPhase, DEFAULT_BEACON_TTL};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::Router;
    use lantern_protocols::PeerAvailability;
    use tokio::sync::broadcast;

    use crate::transport::{PskResolver, Transport, TransportError, TransportResult};

    /// How often each transport call was made.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Calls {
        pub starts: usize,
        pub shutdowns: usize,
        pub listen_starts: usize,
        pub listen_stops: usize,
        pub refreshes: usize,
        pub stops: usize,
    }

    #[derive(Default)]
    struct Failures {
        start: Option<TransportError>,
        refresh: Option<TransportError>,
        stop: Option<TransportError>,
    }

    /// Records calls, fails on request, and lets tests inject availability.
    pub struct MockTransport {
        calls: Mutex<Calls>,
        failures: Mutex<Failures>,
        psk: Mutex<Option<Arc<dyn PskResolver>>>,
        availability: broadcast::Sender<PeerAvailability>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            let (availability, _) = broadcast::channel(64);
            Self {
                calls: Mutex::default(),
                failures: Mutex::default(),
                psk: Mutex::default(),
                availability,
            }
        }
    }

    impl MockTransport {
        pub fn calls(&self) -> Calls {
            *self.calls.lock().unwrap()
        }

        pub fn fail_start(&self, e: TransportError) {
            self.failures.lock().unwrap().start = Some(e);
        }

        pub fn fail_refresh(&self, e: TransportError) {
            self.failures.lock().unwrap().refresh = Some(e);
        }

        pub fn fail_stop(&self, e: TransportError) {
            self.failures.lock().unwrap().stop = Some(e);
        }

        pub fn psk(&self) -> Option<Arc<dyn PskResolver>> {
            self.psk.lock().unwrap().clone()
        }

        pub fn announce(&self, peer: PeerAvailability) {
            let _ = self.availability.send(peer);
        }

        fn record(&self, f: impl FnOnce(&mut Calls)) {
            f(&mut self.calls.lock().unwrap());
        }

        fn take_failure(&self, f: impl FnOnce(&mut Failures) -> Option<TransportError>) -> TransportResult<()> {
            match f(&mut self.failures.lock().unwrap()) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn start(&self, _router: Router, psk: Arc<dyn PskResolver>) -> TransportResult<()> {
            self.record(|c| c.starts += 1);
            self.take_failure(|f| f.start.take())?;
            *self.psk.lock().unwrap() = Some(psk);
            Ok(())
        }

        async fn stop(&self) -> TransportResult<()> {
            self.record(|c| c.shutdowns += 1);
            Ok(())
        }

        async fn start_listening_for_advertisements(&self) -> TransportResult<()> {
            self.record(|c| c.listen_starts += 1);
            Ok(())
        }

        async fn stop_listening_for_advertisements(&self) -> TransportResult<()> {
            self.record(|c| c.listen_stops += 1);
            Ok(())
        }

        async fn start_update_advertising_and_listening(&self) -> TransportResult<()> {
            self.record(|c| c.refreshes += 1);
            self.take_failure(|f| f.refresh.take())
        }

        async fn stop_advertising_and_listening(&self) -> TransportResult<()> {
            self.record(|c| c.stops += 1);
            self.take_failure(|f| f.stop.take())
        }

        fn subscribe_peer_availability(&self) -> broadcast::Receiver<PeerAvailability> {
            self.availability.subscribe()
        }
    }
}
