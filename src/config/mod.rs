//! Configuration distribution
//!
//! Versioned snapshots, durable backends, change notification and the file
//! source that feeds them.

pub mod backend;
pub mod notifier;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod webhook;

pub use backend::{FileBackend, FileBackendConfig, MemoryBackend, SharedBackend};
pub use notifier::{
    spawn_push_delivery, ConfigChangeNotifier, NotifierConfig, NotifierStatsSnapshot,
    SubscriptionHandle, SubscriptionInfo,
};
pub use snapshot::{
    ConfigChange, ConfigEntries, ConfigKey, ConfigSnapshot, DEFAULT_LABEL, DEFAULT_PROFILE,
    SHARED_APPLICATION,
};
pub use source::{flatten_yaml, FileConfigSource, FileSourceConfig, ScanOutcome};
pub use store::{
    ConfigSnapshotStore, Environment, KeySummary, PropertySource, SnapshotStoreConfig,
    SnapshotStoreStatsSnapshot,
};
pub use webhook::WebhookSink;
