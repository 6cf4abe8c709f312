//! Registry Config Server - Service Registry and Config Distribution Node
//!
//! A node that keeps a lease-based registry of live service instances,
//! replicates registry changes to its peers, and serves versioned
//! configuration snapshots with change notification.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Registry Node                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    REST API     │  │   Heartbeat     │  │      Peer Replicator        │  │
//! │  │ (axum, SSE,     │  │   Monitor       │  │  (per-peer queues, retry,   │  │
//! │  │  long-poll)     │  │ (eviction, self │  │   degrade / announce)       │  │
//! │  │                 │  │  preservation)  │  │                             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                                │                                            │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │    Registry Store     │                                │
//! │                    │   (256-way sharded)   │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Configuration                                      │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  File Source    │─▶│ Snapshot Store  │─▶│   Change Notifier           │  │
//! │  │  (YAML repo)    │  │ (versioned,     │  │ (SSE / poll / webhook       │  │
//! │  │                 │  │  retention)     │  │  subscriptions)             │  │
//! │  └─────────────────┘  └────────┬────────┘  └─────────────────────────────┘  │
//! │                                │                                            │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Snapshot Backend     │                                │
//! │                    │  (memory / files)     │                                │
//! │                    └───────────────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: Instance store, lease renewal and heartbeat eviction
//! - [`replication`]: Peer set and event replication
//! - [`config`]: Snapshot store, backends, notifier and file source
//! - [`controlplane`]: Node wiring and the REST API
//! - [`domain`]: Clock and port traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod registry;
pub mod replication;

// Re-export commonly used types
pub use controlplane::{ApiServer, ApiServerConfig, NodeConfig, NodeStatus, RegistryNode};

pub use config::{
    ConfigChange, ConfigChangeNotifier, ConfigEntries, ConfigKey, ConfigSnapshot,
    ConfigSnapshotStore, Environment, FileBackend, FileConfigSource, MemoryBackend,
    SubscriptionHandle,
};

pub use domain::{Clock, ManualClock, NotificationSink, PeerTransport, SnapshotBackend, SystemClock};

pub use error::{Error, ErrorAction, Result};

pub use registry::{
    HeartbeatMonitor, InstanceId, InstanceRegistration, InstanceStatus, RegistryEvent,
    RegistryStore, ServiceInstance,
};

pub use replication::{HttpPeerTransport, PeerState, Replicator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
