//! Beacon downloads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lantern_protocols::PeerAvailability;
use reqwest::StatusCode;
use tracing::trace;

use crate::api::BEACON_PATH;
use crate::error::{Error, Result};

/// Default limit on a single beacon download.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads a peer's beacon blob.
#[async_trait]
pub trait BeaconFetcher: Send + Sync + 'static {
    /// `Ok(None)` when the peer publishes no beacon.
    async fn fetch(&self, peer: &PeerAvailability) -> Result<Option<Bytes>>;
}

/// Fetches `GET /NotificationBeacons` over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpBeaconFetcher {
    client: reqwest::Client,
}

impl HttpBeaconFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// URL of a peer's beacon endpoint.
    pub fn beacon_url(peer: &PeerAvailability) -> String {
        format!("http://{}{}", peer.address(), BEACON_PATH)
    }
}

#[async_trait]
impl BeaconFetcher for HttpBeaconFetcher {
    async fn fetch(&self, peer: &PeerAvailability) -> Result<Option<Bytes>> {
        let url = Self::beacon_url(peer);
        trace!(%url, "Fetching beacons");

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(Some(response.bytes().await?)),
            status => Err(Error::Fetch(format!("{} answered {}", url, status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lantern_protocols::PeerIdentifier;

    #[test]
    fn beacon_url_brackets_ipv6() {
        let v4 = PeerAvailability::tcp(PeerIdentifier::new("a", 0), "10.0.0.2", 8484);
        assert_eq!(
            HttpBeaconFetcher::beacon_url(&v4),
            "http://10.0.0.2:8484/NotificationBeacons"
        );
        let v6 = PeerAvailability::tcp(PeerIdentifier::new("b", 0), "fe80::1", 8484);
        assert_eq!(
            HttpBeaconFetcher::beacon_url(&v6),
            "http://[fe80::1]:8484/NotificationBeacons"
        );
    }
}
