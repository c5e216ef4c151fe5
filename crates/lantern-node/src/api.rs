//! HTTP surface served to peers through the transport.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::notification::PublishedBeacons;

/// Well-known beacon download path.
pub const BEACON_PATH: &str = "/NotificationBeacons";

/// Build the beacon router.
pub fn build_router(beacons: PublishedBeacons) -> Router {
    Router::new()
        .route(BEACON_PATH, get(get_beacons))
        .with_state(beacons)
}

async fn get_beacons(State(beacons): State<PublishedBeacons>) -> Response {
    match beacons.blob() {
        None => StatusCode::NO_CONTENT.into_response(),
        Some(blob) => (
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            blob,
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use lantern_beacon::{generate, KeyPair};
    use std::time::Duration;

    async fn fetch(beacons: &PublishedBeacons) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = get_beacons(State(beacons.clone())).await;
        let status = response.status();
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, cache, body.to_vec())
    }

    #[tokio::test]
    async fn no_beacon_is_no_content() {
        let (status, _, body) = fetch(&PublishedBeacons::default()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn serves_exact_blob_uncached() {
        let beacons = PublishedBeacons::default();
        let set = generate(
            &[KeyPair::generate().public_key()],
            &KeyPair::generate(),
            Duration::from_secs(60),
        )
        .unwrap();
        let expected = set.as_bytes().to_vec();
        beacons.publish(Some(set));

        let (status, cache, body) = fetch(&beacons).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cache.as_deref(), Some("no-cache"));
        assert_eq!(body, expected);
    }
}
