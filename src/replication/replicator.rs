//! Registry Replicator
//!
//! Fans local registry events out to every healthy peer. Each peer has its
//! own bounded queue and worker task, so a slow or dead peer never blocks the
//! registry operation that produced the event, nor the other peers.

use super::peers::{normalize_peer_url, PeerInfo, PeerSet, PeerState};
use crate::domain::clock::SharedClock;
use crate::domain::ports::PeerTransport;
use crate::registry::events::RegistryEvent;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for peer replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Peer base URLs, e.g. `http://registry-2:8761`
    pub peers: Vec<String>,
    /// This node's own base URL, announced to peers on start
    pub self_url: Option<String>,
    /// Push attempts per event per peer
    pub max_attempts: u32,
    /// First retry delay
    pub initial_backoff: Duration,
    /// Retry delay cap
    pub max_backoff: Duration,
    /// Timeout for a single push
    pub push_timeout: Duration,
    /// Consecutive failed events before a peer is degraded
    pub degrade_after_failures: u32,
    /// Events older than this are dropped unsent
    pub event_ttl: Duration,
    /// Per-peer queue capacity
    pub queue_capacity: usize,
    /// How long shutdown waits for workers
    pub drain_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            self_url: None,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            push_timeout: Duration::from_secs(2),
            degrade_after_failures: 3,
            event_ttl: Duration::from_secs(300),
            queue_capacity: 1024,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct ReplicatorStats {
    queued: AtomicU64,
    pushed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
    lagged: AtomicU64,
}

/// Snapshot of replication counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatorStatsSnapshot {
    pub queued: u64,
    pub pushed: u64,
    pub failed: u64,
    /// Subset of `failed` the peer refused outright
    pub rejected: u64,
    pub expired: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub lagged: u64,
}

// =============================================================================
// Replicator
// =============================================================================

struct Shared {
    config: ReplicationConfig,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    clock: SharedClock,
    stats: ReplicatorStats,
    token: CancellationToken,
}

struct PeerWorker {
    tx: mpsc::Sender<RegistryEvent>,
    handle: JoinHandle<()>,
}

/// Best-effort, fire-and-forget replication to peer registries
pub struct Replicator {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<String, PeerWorker>>,
}

impl Replicator {
    pub fn new(
        config: ReplicationConfig,
        transport: Arc<dyn PeerTransport>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let peers = Arc::new(PeerSet::new(config.peers.iter().cloned()));
        Arc::new(Self {
            shared: Arc::new(Shared {
                config,
                peers,
                transport,
                clock,
                stats: ReplicatorStats::default(),
                token: CancellationToken::new(),
            }),
            workers: Mutex::new(HashMap::new()),
        })
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.shared.peers
    }

    pub fn peer_info(&self) -> Vec<PeerInfo> {
        self.shared.peers.snapshot()
    }

    /// Queue an event for every healthy peer
    ///
    /// Never blocks; returns how many peer queues accepted the event.
    pub fn replicate(&self, event: &RegistryEvent) -> usize {
        if !event.is_replicable() {
            return 0;
        }

        let mut queued = 0;
        for url in self.shared.peers.healthy_urls() {
            let Some(tx) = self.worker_sender(&url) else {
                continue;
            };
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    queued += 1;
                    self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %url, instance_id = %event.instance_id, "Replication queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(peer = %url, "Replication worker closed");
                }
            }
        }
        queued
    }

    fn worker_sender(&self, url: &str) -> Option<mpsc::Sender<RegistryEvent>> {
        if self.shared.token.is_cancelled() {
            return None;
        }
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(url) {
            if !worker.handle.is_finished() {
                return Some(worker.tx.clone());
            }
        }

        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));
        let handle = tokio::spawn(peer_worker(self.shared.clone(), url.to_string(), rx));
        workers.insert(url.to_string(), PeerWorker { tx: tx.clone(), handle });
        Some(tx)
    }

    /// A peer announced itself; (re-)include it in fan-out
    pub fn announce(&self, url: &str) -> Option<PeerState> {
        let previous = self.shared.peers.announce(url);
        match previous {
            Some(PeerState::Degraded) => info!(peer = %normalize_peer_url(url), "Degraded peer re-announced, resuming replication"),
            None => info!(peer = %normalize_peer_url(url), "New peer announced"),
            Some(PeerState::Healthy) => debug!(peer = %normalize_peer_url(url), "Peer re-announced"),
        }
        previous
    }

    /// Announce this node to all configured peers, best effort
    pub async fn announce_self(&self) {
        let Some(self_url) = self.shared.config.self_url.clone() else {
            return;
        };
        for url in self.shared.peers.urls() {
            let result = tokio::time::timeout(
                self.shared.config.push_timeout,
                self.shared.transport.announce(&url, &self_url),
            )
            .await;
            match result {
                Ok(Ok(())) => debug!(peer = %url, "Announced to peer"),
                Ok(Err(e)) => warn!(peer = %url, error = %e, "Announce to peer failed"),
                Err(_) => warn!(peer = %url, "Announce to peer timed out"),
            }
        }
    }

    /// Forward local registry events until cancelled
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<RegistryEvent>, token: CancellationToken) {
        info!(peers = self.shared.peers.len(), "Registry replicator started");
        self.announce_self().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        self.replicate(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.shared.stats.lagged.fetch_add(skipped, Ordering::Relaxed);
                        warn!(skipped, "Replicator lagged behind registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Registry replicator stopped");
    }

    /// Stop all peer workers
    ///
    /// Workers abandon queued events; anything still running after the
    /// drain timeout is aborted.
    pub async fn shutdown(&self) {
        self.shared.token.cancel();
        let workers: Vec<(String, PeerWorker)> = self.workers.lock().drain().collect();

        for (url, worker) in workers {
            drop(worker.tx);
            let mut handle = worker.handle;
            if tokio::time::timeout(self.shared.config.drain_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(peer = %url, "Replication worker did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    pub fn stats(&self) -> ReplicatorStatsSnapshot {
        let s = &self.shared.stats;
        ReplicatorStatsSnapshot {
            queued: s.queued.load(Ordering::Relaxed),
            pushed: s.pushed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            expired: s.expired.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            abandoned: s.abandoned.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            lagged: s.lagged.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Peer Worker
// =============================================================================

async fn peer_worker(shared: Arc<Shared>, url: String, mut rx: mpsc::Receiver<RegistryEvent>) {
    debug!(peer = %url, "Replication worker started");

    loop {
        let event = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };
        shared.deliver(&url, event).await;
    }

    rx.close();
    let mut abandoned = 0u64;
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        shared.stats.abandoned.fetch_add(abandoned, Ordering::Relaxed);
        info!(peer = %url, abandoned, "Abandoned queued replication events on shutdown");
    }
}

impl Shared {
    async fn deliver(&self, url: &str, event: RegistryEvent) {
        let age = self.clock.now().signed_duration_since(event.timestamp);
        if age.to_std().map(|a| a > self.config.event_ttl).unwrap_or(false) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %url, instance_id = %event.instance_id, "Replication event expired before delivery");
            return;
        }
        if self.peers.state(url) != Some(PeerState::Healthy) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_interval(self.config.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::select! {
                _ = self.token.cancelled() => return,
                r = tokio::time::timeout(self.config.push_timeout, self.transport.push(url, &event)) => r,
            };

            match result {
                Ok(Ok(())) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    self.peers.record_success(url, self.clock.now());
                    debug!(peer = %url, kind = %event.kind, instance_id = %event.instance_id, attempt, "Replicated event");
                    return;
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    // The peer is reachable; this event will never be accepted
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(peer = %url, kind = %event.kind, instance_id = %event.instance_id, attempt, error = %e, "Peer rejected replication event, not retrying");
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("push timed out after {:?}", self.config.push_timeout),
            }

            if attempt < attempts {
                let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                debug!(peer = %url, attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "Retrying replication push");
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        let degraded = self.peers.record_failure(
            url,
            self.clock.now(),
            last_error.clone(),
            self.config.degrade_after_failures,
        );
        if degraded {
            warn!(peer = %url, error = %last_error, "Peer unreachable, marked degraded and excluded from replication");
        } else {
            warn!(peer = %url, instance_id = %event.instance_id, attempts, error = %last_error, "Replication push failed");
        }
    }
}
