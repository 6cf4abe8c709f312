//! Heartbeat Monitor
//!
//! Periodically sweeps the registry and evicts instances whose lease lapsed.
//! When a single sweep would evict more than the self-preservation
//! threshold, nothing is evicted: a burst of missed heartbeats is more
//! likely a partition around this node than a mass outage.

use super::instance::InstanceId;
use super::store::RegistryStore;
use crate::domain::clock::SharedClock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the heartbeat monitor
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between sweeps
    pub eviction_interval: Duration,
    /// Time after the last renewal before an instance is expired
    pub lease_expiry: Duration,
    /// Fraction of instances that may expire in one sweep before eviction is suspended
    pub self_preservation_threshold: f64,
    /// Self-preservation only engages with at least this many instances
    pub self_preservation_min_instances: usize,
    /// Disable to always evict
    pub self_preservation_enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            eviction_interval: Duration::from_secs(30),
            lease_expiry: Duration::from_secs(90),
            self_preservation_threshold: 0.15,
            self_preservation_min_instances: 10,
            self_preservation_enabled: true,
        }
    }
}

// =============================================================================
// Sweep Outcome
// =============================================================================

/// Result of one sweep
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Expired instances were evicted (possibly none)
    Evicted {
        evicted: Vec<InstanceId>,
        /// Candidates that were renewed before the evict landed
        skipped: usize,
        total: usize,
    },
    /// Too many instances expired at once; nothing was evicted
    SelfPreservation { expired: usize, total: usize },
}

impl SweepOutcome {
    pub fn evicted_count(&self) -> usize {
        match self {
            SweepOutcome::Evicted { evicted, .. } => evicted.len(),
            SweepOutcome::SelfPreservation { .. } => 0,
        }
    }

    pub fn is_self_preservation(&self) -> bool {
        matches!(self, SweepOutcome::SelfPreservation { .. })
    }
}

/// Monitor counters
#[derive(Debug, Default)]
struct MonitorStats {
    sweeps: AtomicU64,
    evicted: AtomicU64,
    self_preservation_sweeps: AtomicU64,
}

/// Snapshot of monitor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatsSnapshot {
    pub sweeps: u64,
    pub evicted: u64,
    pub self_preservation_sweeps: u64,
}

// =============================================================================
// Heartbeat Monitor
// =============================================================================

/// Lease expiry sweeper
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    store: Arc<RegistryStore>,
    clock: SharedClock,
    stats: MonitorStats,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, store: Arc<RegistryStore>, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            clock,
            stats: MonitorStats::default(),
        })
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Run one sweep
    pub fn sweep(&self) -> SweepOutcome {
        let now = self.clock.now();
        let lease = self.config.lease_expiry;
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        let pruned = self.store.prune_tombstones(now, lease);
        if pruned > 0 {
            debug!(pruned, "Pruned registry tombstones");
        }

        let (total, candidates) = self.store.expired_candidates(now, lease);
        if candidates.is_empty() {
            return SweepOutcome::Evicted {
                evicted: Vec::new(),
                skipped: 0,
                total,
            };
        }

        if self.should_preserve(candidates.len(), total) {
            self.stats.self_preservation_sweeps.fetch_add(1, Ordering::Relaxed);
            warn!(
                expired = candidates.len(),
                total,
                threshold = self.config.self_preservation_threshold,
                "Self-preservation engaged: too many leases expired in one sweep, skipping eviction"
            );
            return SweepOutcome::SelfPreservation {
                expired: candidates.len(),
                total,
            };
        }

        let mut evicted = Vec::with_capacity(candidates.len());
        let mut skipped = 0;
        for id in candidates {
            if self.store.evict_if_expired(&id, now, lease) {
                evicted.push(id);
            } else {
                // Renewed or cancelled concurrently; picked up next sweep if still stale
                skipped += 1;
            }
        }

        self.stats.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), total, "Eviction sweep complete");
        }

        SweepOutcome::Evicted {
            evicted,
            skipped,
            total,
        }
    }

    fn should_preserve(&self, expired: usize, total: usize) -> bool {
        if !self.config.self_preservation_enabled
            || total == 0
            || total < self.config.self_preservation_min_instances
        {
            return false;
        }
        (expired as f64 / total as f64) > self.config.self_preservation_threshold
    }

    /// Sweep on a fixed interval until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.eviction_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        info!(
            interval_secs = self.config.eviction_interval.as_secs(),
            lease_secs = self.config.lease_expiry.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }

    pub fn stats(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            sweeps: self.stats.sweeps.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            self_preservation_sweeps: self.stats.self_preservation_sweeps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::registry::events::RegistryEventKind;
    use crate::registry::instance::InstanceRegistration;
    use crate::registry::store::RegistryConfig;

    fn setup(config: HeartbeatConfig) -> (Arc<RegistryStore>, Arc<HeartbeatMonitor>, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let registry_config = RegistryConfig {
            lease_expiry: config.lease_expiry,
            ..Default::default()
        };
        let store = RegistryStore::with_clock(registry_config, clock.clone());
        let monitor = HeartbeatMonitor::new(config, store.clone(), clock.clone());
        (store, monitor, clock)
    }

    fn register_up(store: &RegistryStore, id: &str, app: &str) {
        store
            .register(InstanceRegistration::new(id, app, "10.0.0.1", 8080))
            .unwrap();
        store.renew(id).unwrap();
    }

    #[test]
    fn test_lapsed_instance_is_evicted_and_hidden_from_lookup() {
        let (store, monitor, clock) = setup(HeartbeatConfig::default());
        let mut events = store.subscribe();
        register_up(&store, "svc-1", "orders");

        for _ in 0..3 {
            clock.advance(Duration::from_secs(30));
            store.renew("svc-1").unwrap();
            assert_eq!(monitor.sweep().evicted_count(), 0);
        }
        assert_eq!(store.lookup("orders").len(), 1);

        clock.advance(Duration::from_secs(91));
        // Hidden as soon as the lease lapses, before any sweep
        assert!(store.lookup("orders").is_empty());
        let outcome = monitor.sweep();
        assert_eq!(outcome.evicted_count(), 1);
        assert!(store.lookup("orders").iter().all(|i| i.instance_id.as_str() != "svc-1"));

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.last(), Some(&RegistryEventKind::Evict));
    }

    #[test]
    fn test_instance_within_lease_survives() {
        let (store, monitor, clock) = setup(HeartbeatConfig::default());
        register_up(&store, "svc-1", "orders");

        clock.advance(Duration::from_secs(90));
        assert_eq!(monitor.sweep().evicted_count(), 0);
        assert!(store.contains("svc-1"));
    }

    #[test]
    fn test_self_preservation_blocks_mass_eviction() {
        let (store, monitor, clock) = setup(HeartbeatConfig::default());
        for i in 0..100 {
            register_up(&store, &format!("svc-{:03}", i), "orders");
        }

        clock.advance(Duration::from_secs(91));
        // 84 renew in time, 16 do not
        for i in 16..100 {
            store.renew(format!("svc-{:03}", i)).unwrap();
        }

        let outcome = monitor.sweep();
        assert_eq!(
            outcome,
            SweepOutcome::SelfPreservation {
                expired: 16,
                total: 100
            }
        );
        assert_eq!(store.len(), 100);
        assert_eq!(monitor.stats().self_preservation_sweeps, 1);

        // Preserved entries stay in the table but are not served
        assert_eq!(store.lookup("orders").len(), 84);
        clock.advance(Duration::from_secs(600));
        assert!(monitor.sweep().is_self_preservation());
        assert!(store.lookup("orders").is_empty());
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_eviction_at_threshold_proceeds() {
        let (store, monitor, clock) = setup(HeartbeatConfig::default());
        for i in 0..100 {
            register_up(&store, &format!("svc-{:03}", i), "orders");
        }

        clock.advance(Duration::from_secs(91));
        for i in 15..100 {
            store.renew(format!("svc-{:03}", i)).unwrap();
        }

        let outcome = monitor.sweep();
        assert_eq!(outcome.evicted_count(), 15);
        assert_eq!(store.len(), 85);
    }

    #[test]
    fn test_self_preservation_disabled() {
        let config = HeartbeatConfig {
            self_preservation_enabled: false,
            ..Default::default()
        };
        let (store, monitor, clock) = setup(config);
        for i in 0..20 {
            register_up(&store, &format!("svc-{:02}", i), "orders");
        }

        clock.advance(Duration::from_secs(120));
        assert_eq!(monitor.sweep().evicted_count(), 20);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let config = HeartbeatConfig {
            eviction_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (_, monitor, _) = setup(config);
        let token = CancellationToken::new();
        let handle = tokio::spawn(monitor.clone().run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(monitor.stats().sweeps >= 1);
    }
}
