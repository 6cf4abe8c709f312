//! HTTP Peer Transport
//!
//! Pushes registry events to peers over their REST API. A 2xx response is
//! the peer's acknowledgment.

use super::peers::normalize_peer_url;
use crate::domain::ports::PeerTransport;
use crate::error::{Error, Result};
use crate::registry::events::RegistryEvent;
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Path a peer accepts replicated events on
pub const REPLICATE_PATH: &str = "/registry/replicate";

/// Path a peer accepts announcements on
pub const ANNOUNCE_PATH: &str = "/registry/peers/announce";

/// Announcement body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    pub url: String,
}

/// reqwest-backed [`PeerTransport`]
#[derive(Clone)]
pub struct HttpPeerTransport {
    http_client: HttpClient,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http_client })
    }

    async fn post<T: Serialize + ?Sized>(&self, peer_url: &str, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", normalize_peer_url(peer_url), path);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::PeerPush {
                peer: peer_url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Peer acknowledged");
            Ok(())
        } else {
            Err(Error::from_status(peer_url, status.as_u16(), |reason| Error::PeerPush {
                peer: peer_url.to_string(),
                reason: format!("peer {}", reason),
            }))
        }
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn push(&self, peer_url: &str, event: &RegistryEvent) -> Result<()> {
        self.post(peer_url, REPLICATE_PATH, event).await
    }

    async fn announce(&self, peer_url: &str, self_url: &str) -> Result<()> {
        let body = PeerAnnouncement {
            url: self_url.to_string(),
        };
        self.post(peer_url, ANNOUNCE_PATH, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_unreachable_peer_is_a_push_error() {
        let transport = HttpPeerTransport::new(Duration::from_millis(200)).unwrap();
        // Port 9 (discard) on localhost is not expected to serve HTTP
        let result = transport.announce("http://127.0.0.1:9/", "http://self:8761").await;
        assert_matches!(result, Err(Error::PeerPush { ref peer, .. }) if peer == "http://127.0.0.1:9/");
    }
}
