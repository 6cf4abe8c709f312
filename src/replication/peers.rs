//! Peer Set
//!
//! Tracks the configured registry peers and whether each one currently takes
//! part in replication fan-out.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replication state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Receives fan-out
    Healthy,
    /// Excluded from fan-out until it re-announces itself
    Degraded,
}

/// Public view of one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub url: String,
    pub state: PeerState,
    pub consecutive_failures: u32,
    pub events_pushed: u64,
    pub events_failed: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl PeerInfo {
    fn new(url: String) -> Self {
        Self {
            url,
            state: PeerState::Healthy,
            consecutive_failures: 0,
            events_pushed: 0,
            events_failed: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
        }
    }
}

/// Normalize a peer URL so the same peer is not tracked twice
pub fn normalize_peer_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Set of known peers
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<BTreeMap<String, PeerInfo>>,
}

impl PeerSet {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        let set = Self::default();
        for url in urls {
            set.add(&url);
        }
        set
    }

    /// Add a peer if unknown; returns true if it was added
    pub fn add(&self, url: &str) -> bool {
        let url = normalize_peer_url(url);
        if url.is_empty() {
            return false;
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&url) {
            return false;
        }
        peers.insert(url.clone(), PeerInfo::new(url));
        true
    }

    /// Handle a (re-)announcement: adds unknown peers, restores degraded ones
    ///
    /// Returns the previous state, or `None` if the peer was new.
    pub fn announce(&self, url: &str) -> Option<PeerState> {
        let url = normalize_peer_url(url);
        let mut peers = self.peers.write();
        match peers.get_mut(&url) {
            Some(peer) => {
                let previous = peer.state;
                peer.state = PeerState::Healthy;
                peer.consecutive_failures = 0;
                Some(previous)
            }
            None => {
                peers.insert(url.clone(), PeerInfo::new(url));
                None
            }
        }
    }

    pub fn record_success(&self, url: &str, at: DateTime<Utc>) {
        if let Some(peer) = self.peers.write().get_mut(url) {
            peer.consecutive_failures = 0;
            peer.events_pushed += 1;
            peer.last_success = Some(at);
        }
    }

    /// Record a failed event push
    ///
    /// Returns true if this failure moved the peer to `Degraded`.
    pub fn record_failure(&self, url: &str, at: DateTime<Utc>, error: String, degrade_after: u32) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(url) else {
            return false;
        };
        peer.consecutive_failures += 1;
        peer.events_failed += 1;
        peer.last_failure = Some(at);
        peer.last_error = Some(error);

        if peer.state == PeerState::Healthy && peer.consecutive_failures >= degrade_after {
            peer.state = PeerState::Degraded;
            return true;
        }
        false
    }

    pub fn state(&self, url: &str) -> Option<PeerState> {
        self.peers.read().get(url).map(|p| p.state)
    }

    /// URLs that receive fan-out
    pub fn healthy_urls(&self) -> Vec<String> {
        self.peers
            .read()
            .values()
            .filter(|p| p.state == PeerState::Healthy)
            .map(|p| p.url.clone())
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
