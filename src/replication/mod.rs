//! Peer replication
//!
//! Best-effort, eventually consistent propagation of registry events to the
//! other nodes of the cluster.

pub mod http;
pub mod peers;
pub mod replicator;

pub use http::{HttpPeerTransport, PeerAnnouncement};
pub use peers::{PeerInfo, PeerSet, PeerState};
pub use replicator::{ReplicationConfig, Replicator, ReplicatorStatsSnapshot};
