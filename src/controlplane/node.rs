//! Registry Node
//!
//! Wires the registry, heartbeat monitor, replicator, snapshot store,
//! notifier and file source into one running node, and owns the background
//! tasks that drive them.

use crate::config::{
    spawn_push_delivery, ConfigChangeNotifier, ConfigKey, ConfigSnapshotStore, FileBackend,
    FileBackendConfig, FileConfigSource, FileSourceConfig, MemoryBackend, NotifierConfig,
    NotifierStatsSnapshot, SharedBackend, SnapshotStoreConfig, SnapshotStoreStatsSnapshot,
    WebhookSink,
};
use crate::domain::clock::{system_clock, SharedClock};
use crate::domain::ports::PeerTransport;
use crate::error::{Error, Result};
use crate::registry::{
    HeartbeatConfig, HeartbeatMonitor, MonitorStatsSnapshot, RegistryConfig, RegistryEvent,
    RegistryStatsSnapshot, RegistryStore, ReplicationOutcome,
};
use crate::replication::{
    HttpPeerTransport, PeerInfo, PeerState, ReplicationConfig, Replicator, ReplicatorStatsSnapshot,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Node Configuration
// =============================================================================

/// Where config history is kept
#[derive(Debug, Clone)]
pub enum ConfigBackendKind {
    /// Volatile, for tests and throwaway nodes
    Memory,
    /// JSON files on disk
    File(FileBackendConfig),
}

/// Configuration for a whole node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub registry: RegistryConfig,
    pub heartbeat: HeartbeatConfig,
    pub replication: ReplicationConfig,
    pub snapshot_store: SnapshotStoreConfig,
    pub notifier: NotifierConfig,
    pub config_backend: ConfigBackendKind,
    /// Optional directory source feeding the snapshot store
    pub source: Option<FileSourceConfig>,
    /// Timeout for one webhook delivery
    pub webhook_timeout: Duration,
    /// How long shutdown waits for background tasks
    pub shutdown_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            replication: ReplicationConfig::default(),
            snapshot_store: SnapshotStoreConfig::default(),
            notifier: NotifierConfig::default(),
            config_backend: ConfigBackendKind::Memory,
            source: None,
            webhook_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Webhooks
// =============================================================================

/// Push-mode subscription registered over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInfo {
    pub id: u64,
    pub client_id: String,
    pub url: String,
    pub application: String,
    pub profile: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

struct WebhookRegistration {
    info: WebhookInfo,
    token: CancellationToken,
}

// =============================================================================
// Node Status
// =============================================================================

/// Summary of the node served on `/status` and exported as metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub registry: RegistryStatsSnapshot,
    pub heartbeat: MonitorStatsSnapshot,
    pub replication: ReplicatorStatsSnapshot,
    pub peers: Vec<PeerInfo>,
    pub config: SnapshotStoreStatsSnapshot,
    pub notifier: NotifierStatsSnapshot,
    pub webhooks: usize,
    pub config_backend_healthy: bool,
}

// =============================================================================
// Registry Node
// =============================================================================

/// One registry/config server node
pub struct RegistryNode {
    config: NodeConfig,
    clock: SharedClock,
    registry: Arc<RegistryStore>,
    monitor: Arc<HeartbeatMonitor>,
    replicator: Arc<Replicator>,
    config_store: Arc<ConfigSnapshotStore>,
    notifier: Arc<ConfigChangeNotifier>,
    source: Option<Arc<FileConfigSource>>,
    webhooks: Arc<DashMap<u64, WebhookRegistration>>,
    next_webhook_id: AtomicU64,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    started_at: DateTime<Utc>,
}

impl RegistryNode {
    /// Build a node with HTTP peer transport and the configured backend
    pub async fn build(config: NodeConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpPeerTransport::new(config.replication.push_timeout)?);
        let backend: SharedBackend = match &config.config_backend {
            ConfigBackendKind::Memory => Arc::new(MemoryBackend::new()),
            ConfigBackendKind::File(file) => Arc::new(FileBackend::open(file.clone()).await?),
        };
        Self::with_parts(config, transport, backend, system_clock()).await
    }

    /// Build a node from explicit collaborators
    pub async fn with_parts(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        backend: SharedBackend,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        // The store hides lapsed leases using the same window the monitor evicts on
        let registry_config = RegistryConfig {
            lease_expiry: config.heartbeat.lease_expiry,
            ..config.registry.clone()
        };
        let registry = RegistryStore::with_clock(registry_config, clock.clone());
        let monitor = HeartbeatMonitor::new(config.heartbeat.clone(), registry.clone(), clock.clone());
        let replicator = Replicator::new(config.replication.clone(), transport, clock.clone());
        let notifier = ConfigChangeNotifier::new(config.notifier.clone(), clock.clone());
        let config_store = ConfigSnapshotStore::open(
            config.snapshot_store.clone(),
            backend,
            notifier.clone(),
            clock.clone(),
        )
        .await?;
        let source = config
            .source
            .clone()
            .map(|source| FileConfigSource::new(source, config_store.clone()));

        Ok(Arc::new(Self {
            started_at: clock.now(),
            config,
            clock,
            registry,
            monitor,
            replicator,
            config_store,
            notifier,
            source,
            webhooks: Arc::new(DashMap::new()),
            next_webhook_id: AtomicU64::new(1),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn config_store(&self) -> &Arc<ConfigSnapshotStore> {
        &self.config_store
    }

    pub fn notifier(&self) -> &Arc<ConfigChangeNotifier> {
        &self.notifier
    }

    /// Cancelled when the node shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn background loops; calling twice is a no-op
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.monitor.clone().run(self.token.child_token())));
        tasks.push(tokio::spawn(
            self.replicator
                .clone()
                .run(self.registry.subscribe(), self.token.child_token()),
        ));
        tasks.push(tokio::spawn(self.notifier.clone().run_expiry(self.token.child_token())));
        if let Some(source) = &self.source {
            tasks.push(tokio::spawn(source.clone().run(self.token.child_token())));
        }

        info!(
            peers = self.replicator.peers().len(),
            lease_expiry_secs = self.config.heartbeat.lease_expiry.as_secs(),
            eviction_interval_secs = self.config.heartbeat.eviction_interval.as_secs(),
            config_source = self.source.is_some(),
            "Registry node started"
        );
    }

    /// Stop background loops and drop subscriptions
    pub async fn shutdown(&self) {
        info!("Registry node shutting down");
        self.token.cancel();
        self.notifier.close_all();
        self.replicator.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }
        info!("Registry node stopped");
    }

    // =========================================================================
    // Peer Operations
    // =========================================================================

    /// Apply an event pushed by a peer
    pub fn apply_peer_event(&self, event: RegistryEvent) -> Result<ReplicationOutcome> {
        self.registry.apply_replicated(event.from_peer())
    }

    /// A peer (re)announced itself
    pub fn announce_peer(&self, url: &str) -> Result<Option<PeerState>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Validation(format!("peer url must be http(s): {}", url)));
        }
        Ok(self.replicator.announce(url))
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Register a push-mode subscription delivering to `url`
    pub async fn add_webhook(
        &self,
        key: &ConfigKey,
        client_id: &str,
        url: &str,
        last_seen_version: Option<u64>,
    ) -> Result<WebhookInfo> {
        let sink = Arc::new(WebhookSink::new(client_id, url, self.config.webhook_timeout)?);
        let handle = self
            .config_store
            .subscribe(client_id, key, last_seen_version)
            .await?;

        let id = self.next_webhook_id.fetch_add(1, Ordering::Relaxed);
        let info = WebhookInfo {
            id,
            client_id: client_id.to_string(),
            url: url.to_string(),
            application: key.application.clone(),
            profile: key.profile.clone(),
            label: key.label.clone(),
            created_at: self.clock.now(),
        };

        let token = self.token.child_token();
        self.webhooks.insert(
            id,
            WebhookRegistration {
                info: info.clone(),
                token: token.clone(),
            },
        );

        let delivery = spawn_push_delivery(handle, sink, &self.config.notifier, token);
        let webhooks = self.webhooks.clone();
        tokio::spawn(async move {
            let _ = delivery.await;
            webhooks.remove(&id);
        });

        info!(webhook_id = id, client_id, url, key = %key, "Webhook registered");
        Ok(info)
    }

    /// Stop a webhook; returns false if unknown
    pub fn remove_webhook(&self, id: u64) -> bool {
        match self.webhooks.remove(&id) {
            Some((_, registration)) => {
                registration.token.cancel();
                info!(webhook_id = id, "Webhook removed");
                true
            }
            None => false,
        }
    }

    pub fn webhooks(&self) -> Vec<WebhookInfo> {
        let mut hooks: Vec<WebhookInfo> = self.webhooks.iter().map(|e| e.value().info.clone()).collect();
        hooks.sort_by_key(|h| h.id);
        hooks
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> NodeStatus {
        let now = self.clock.now();
        NodeStatus {
            version: crate::VERSION.to_string(),
            started_at: self.started_at,
            uptime_secs: now
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0) as u64,
            registry: self.registry.stats(),
            heartbeat: self.monitor.stats(),
            replication: self.replicator.stats(),
            peers: self.replicator.peer_info(),
            config: self.config_store.stats(),
            notifier: self.notifier.stats(),
            webhooks: self.webhooks.len(),
            config_backend_healthy: self.config_store.health_check().await.unwrap_or(false),
        }
    }

    /// Ready once the config backend is reachable
    pub async fn is_ready(&self) -> bool {
        self.config_store.health_check().await.unwrap_or(false)
    }
}
