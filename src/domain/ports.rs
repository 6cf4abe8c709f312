//! Domain Ports - Core trait definitions for the node
//!
//! These traits define the boundaries between the registry/config logic and
//! external systems (peer nodes, durable storage, subscribers). Adapters
//! implement these traits to provide concrete functionality.

use crate::config::snapshot::{ConfigChange, ConfigKey, ConfigSnapshot};
use crate::error::Result;
use crate::registry::events::RegistryEvent;
use async_trait::async_trait;

// =============================================================================
// Peer Transport
// =============================================================================

/// Push/ack channel to another registry node
///
/// A successful return is the peer's acknowledgment.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver one registry event to a peer
    async fn push(&self, peer_url: &str, event: &RegistryEvent) -> Result<()>;

    /// Tell a peer that `self_url` is reachable again
    async fn announce(&self, peer_url: &str, self_url: &str) -> Result<()>;
}

// =============================================================================
// Snapshot Backend
// =============================================================================

/// Durable storage for configuration history
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Load every stored snapshot
    async fn load_all(&self) -> Result<Vec<ConfigSnapshot>>;

    /// Store a new version
    ///
    /// Must fail with `Conflict` if the version already exists.
    async fn persist(&self, snapshot: &ConfigSnapshot) -> Result<()>;

    /// Delete versions of `key` strictly below `keep_from`
    ///
    /// Returns the number of versions removed.
    async fn purge(&self, key: &ConfigKey, keep_from: u64) -> Result<usize>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Notification Sink
// =============================================================================

/// Push-mode delivery target for config changes
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one change; `Ok` acknowledges it
    async fn deliver(&self, change: &ConfigChange) -> Result<()>;

    /// Target description for logs
    fn target(&self) -> String;
}
