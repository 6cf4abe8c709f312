//! Sharded Registry Store
//!
//! A 256-way sharded table of service instances. Mutations on one instance
//! ID take that shard's write lock, so they are serialized per instance
//! while instances on other shards proceed concurrently.

use super::events::{RegistryEvent, RegistryEventKind};
use super::instance::{
    InstanceId, InstanceRegistration, InstanceStatus, ServiceInstance, REGISTRY_SHARD_COUNT,
};
use crate::domain::clock::{system_clock, SharedClock};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the registry store
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
    /// Instances not renewed within this window are no longer served as live
    pub lease_expiry: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 4096,
            lease_expiry: Duration::from_secs(90),
        }
    }
}

// =============================================================================
// Shard Statistics
// =============================================================================

/// Statistics for a single shard
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ShardStats {
    /// Number of instances in shard
    pub instance_count: AtomicU64,
    /// Total updates to this shard
    pub update_count: AtomicU64,
}

// =============================================================================
// Registry Shard
// =============================================================================

#[derive(Debug, Default)]
struct ShardState {
    instances: HashMap<InstanceId, ServiceInstance>,
    /// Removal timestamps, so late replicated upserts cannot resurrect
    tombstones: HashMap<InstanceId, DateTime<Utc>>,
}

/// A single shard of the registry
#[repr(C, align(64))]
pub struct RegistryShard {
    state: RwLock<ShardState>,
    stats: ShardStats,
}

impl std::fmt::Debug for RegistryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryShard")
            .field("instance_count", &self.stats.instance_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            state: RwLock::new(ShardState::default()),
            stats: ShardStats::default(),
        }
    }

    fn instance_count(&self) -> usize {
        self.stats.instance_count.load(Ordering::Relaxed) as usize
    }

    /// Insert or replace; returns true if the ID was new
    fn upsert(&self, instance: ServiceInstance) -> bool {
        let mut state = self.state.write();
        state.tombstones.remove(&instance.instance_id);
        let is_new = state
            .instances
            .insert(instance.instance_id.clone(), instance)
            .is_none();
        if is_new {
            self.stats.instance_count.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        is_new
    }

    fn get(&self, id: &InstanceId) -> Option<ServiceInstance> {
        self.state.read().instances.get(id).cloned()
    }

    /// Apply `f` to an instance under the shard write lock
    fn modify<T>(
        &self,
        id: &InstanceId,
        f: impl FnOnce(&mut ServiceInstance) -> T,
    ) -> Option<T> {
        let mut state = self.state.write();
        let result = state.instances.get_mut(id).map(f);
        if result.is_some() {
            self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Remove an instance and leave a tombstone
    fn remove(&self, id: &InstanceId, at: DateTime<Utc>) -> Option<ServiceInstance> {
        let mut state = self.state.write();
        let removed = state.instances.remove(id);
        if removed.is_some() {
            state.tombstones.insert(id.clone(), at);
            self.stats.instance_count.fetch_sub(1, Ordering::Relaxed);
            self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove only if the lease is still expired at the time the lock is held
    fn remove_if_expired(
        &self,
        id: &InstanceId,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Option<ServiceInstance> {
        let mut state = self.state.write();
        let expired = state
            .instances
            .get(id)
            .map(|i| i.is_expired(now, lease))
            .unwrap_or(false);
        if !expired {
            return None;
        }
        let removed = state.instances.remove(id);
        if removed.is_some() {
            state.tombstones.insert(id.clone(), now);
            self.stats.instance_count.fetch_sub(1, Ordering::Relaxed);
            self.stats.update_count.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn instances(&self) -> Vec<ServiceInstance> {
        self.state.read().instances.values().cloned().collect()
    }

    fn expired_ids(&self, now: DateTime<Utc>, lease: chrono::Duration) -> Vec<InstanceId> {
        self.state
            .read()
            .instances
            .values()
            .filter(|i| i.is_expired(now, lease))
            .map(|i| i.instance_id.clone())
            .collect()
    }

    fn prune_tombstones(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let before = state.tombstones.len();
        state.tombstones.retain(|_, removed_at| *removed_at > cutoff);
        before - state.tombstones.len()
    }
}

// =============================================================================
// Global Statistics
// =============================================================================

/// Counters across all shards
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub total_instances: AtomicU64,
    pub registrations: AtomicU64,
    pub renewals: AtomicU64,
    pub cancellations: AtomicU64,
    pub evictions: AtomicU64,
    pub replicated_applied: AtomicU64,
    pub replicated_ignored: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self, up_instances: u64) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            total_instances: self.total_instances.load(Ordering::Relaxed),
            up_instances,
            registrations: self.registrations.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            replicated_applied: self.replicated_applied.load(Ordering::Relaxed),
            replicated_ignored: self.replicated_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatsSnapshot {
    pub total_instances: u64,
    pub up_instances: u64,
    pub registrations: u64,
    pub renewals: u64,
    pub cancellations: u64,
    pub evictions: u64,
    pub replicated_applied: u64,
    pub replicated_ignored: u64,
}

/// Per-application instance counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub app_name: String,
    pub instances: u64,
    pub up_instances: u64,
}

/// Result of applying a peer event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The event changed local state
    Applied,
    /// The event lost to a newer local write or tombstone
    Stale,
}

// =============================================================================
// Registry Store
// =============================================================================

/// In-memory registry of service instances
pub struct RegistryStore {
    shards: Box<[RegistryShard]>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
    clock: SharedClock,
    lease: chrono::Duration,
}

impl RegistryStore {
    /// Create a registry on the wall clock
    pub fn new() -> Arc<Self> {
        Self::with_clock(RegistryConfig::default(), system_clock())
    }

    /// Create a registry with explicit config and clock
    pub fn with_clock(config: RegistryConfig, clock: SharedClock) -> Arc<Self> {
        let shards: Vec<RegistryShard> = (0..REGISTRY_SHARD_COUNT)
            .map(|_| RegistryShard::new())
            .collect();
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Arc::new(Self {
            shards: shards.into_boxed_slice(),
            stats: RegistryStats::default(),
            event_sender,
            clock,
            lease: to_chrono(config.lease_expiry),
        })
    }

    #[inline]
    fn shard(&self, id: &InstanceId) -> &RegistryShard {
        &self.shards[id.shard_index()]
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine
        let _ = self.event_sender.send(event);
    }

    /// Register or re-register an instance
    ///
    /// Replaces any existing entry with the same ID, resets the status to
    /// `STARTING` and starts a new lease.
    pub fn register(&self, registration: InstanceRegistration) -> Result<ServiceInstance> {
        registration.validate()?;

        let now = self.clock.now();
        let instance = ServiceInstance::from_registration(registration, now);

        if self.shard(&instance.instance_id).upsert(instance.clone()) {
            self.stats.total_instances.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);

        info!(
            instance_id = %instance.instance_id,
            app = %instance.app_name,
            address = %instance.address(),
            "Instance registered"
        );
        self.emit(RegistryEvent::upsert(RegistryEventKind::Register, &instance, now));

        Ok(instance)
    }

    /// Renew an instance's lease
    pub fn renew(&self, instance_id: impl Into<InstanceId>) -> Result<()> {
        let id = instance_id.into();
        let now = self.clock.now();

        let renewed = self
            .shard(&id)
            .modify(&id, |instance| {
                let renewed = instance.renew(now);
                (renewed, instance.clone())
            })
            .ok_or_else(|| Error::not_found("Instance", id.as_str()))?;

        match renewed {
            (true, instance) => {
                self.stats.renewals.fetch_add(1, Ordering::Relaxed);
                self.emit(RegistryEvent::upsert(RegistryEventKind::Renew, &instance, now));
            }
            (false, _) => {
                debug!(instance_id = %id, "Renewal ignored for DOWN instance");
            }
        }

        Ok(())
    }

    /// Remove an instance; absent IDs are a no-op
    ///
    /// Returns whether an instance was removed.
    pub fn cancel(&self, instance_id: impl Into<InstanceId>) -> bool {
        let id = instance_id.into();
        let now = self.clock.now();

        match self.shard(&id).remove(&id, now) {
            Some(instance) => {
                self.stats.total_instances.fetch_sub(1, Ordering::Relaxed);
                self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
                info!(instance_id = %id, app = %instance.app_name, "Instance cancelled");
                self.emit(RegistryEvent::removal(RegistryEventKind::Cancel, &instance, now));
                true
            }
            None => false,
        }
    }

    /// Override an instance's status
    pub fn set_status(
        &self,
        instance_id: impl Into<InstanceId>,
        status: InstanceStatus,
    ) -> Result<ServiceInstance> {
        let id = instance_id.into();
        let now = self.clock.now();

        let instance = self
            .shard(&id)
            .modify(&id, |instance| {
                instance.status = status;
                instance.last_updated = now;
                instance.clone()
            })
            .ok_or_else(|| Error::not_found("Instance", id.as_str()))?;

        info!(instance_id = %id, status = %status, "Instance status changed");
        self.emit(RegistryEvent::upsert(RegistryEventKind::Status, &instance, now));

        Ok(instance)
    }

    /// Whether an instance is UP with a live lease at `now`
    ///
    /// Lapsed instances stay in the table until swept (or indefinitely under
    /// self-preservation) but are never served.
    fn is_serving(&self, instance: &ServiceInstance, now: DateTime<Utc>) -> bool {
        instance.is_up() && !instance.is_expired(now, self.lease)
    }

    /// Serving instances of one application, ordered by instance ID
    pub fn lookup(&self, app_name: &str) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        let mut instances: Vec<ServiceInstance> = self
            .shards
            .iter()
            .flat_map(|shard| shard.instances())
            .filter(|i| i.app_name == app_name && self.is_serving(i, now))
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    /// Get an instance by ID, whatever its status
    pub fn get(&self, instance_id: impl Into<InstanceId>) -> Option<ServiceInstance> {
        let id = instance_id.into();
        self.shard(&id).get(&id)
    }

    /// Check if an instance exists
    pub fn contains(&self, instance_id: impl Into<InstanceId>) -> bool {
        self.get(instance_id).is_some()
    }

    /// Every registered instance
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        self.shards.iter().flat_map(|shard| shard.instances()).collect()
    }

    /// Instance counts per application
    pub fn applications(&self) -> Vec<ApplicationSummary> {
        let now = self.clock.now();
        let mut apps: BTreeMap<String, ApplicationSummary> = BTreeMap::new();
        for instance in self.all_instances() {
            let summary = apps
                .entry(instance.app_name.clone())
                .or_insert_with(|| ApplicationSummary {
                    app_name: instance.app_name.clone(),
                    instances: 0,
                    up_instances: 0,
                });
            summary.instances += 1;
            if self.is_serving(&instance, now) {
                summary.up_instances += 1;
            }
        }
        apps.into_values().collect()
    }

    /// Total instance count
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.instance_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instances whose lease lapsed at `now`, plus the current total
    pub fn expired_candidates(&self, now: DateTime<Utc>, lease: Duration) -> (usize, Vec<InstanceId>) {
        let lease = to_chrono(lease);
        let mut total = 0;
        let mut expired = Vec::new();
        for shard in self.shards.iter() {
            total += shard.instance_count();
            expired.extend(shard.expired_ids(now, lease));
        }
        (total, expired)
    }

    /// Evict an instance if its lease is still expired
    ///
    /// The expiry check runs under the shard write lock so a renew racing
    /// the sweep wins.
    pub fn evict_if_expired(&self, instance_id: &InstanceId, now: DateTime<Utc>, lease: Duration) -> bool {
        match self
            .shard(instance_id)
            .remove_if_expired(instance_id, now, to_chrono(lease))
        {
            Some(instance) => {
                self.stats.total_instances.fetch_sub(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                info!(
                    instance_id = %instance_id,
                    app = %instance.app_name,
                    last_renewal = %instance.last_renewal,
                    "Instance evicted"
                );
                self.emit(RegistryEvent::removal(RegistryEventKind::Evict, &instance, now));
                true
            }
            None => false,
        }
    }

    /// Drop tombstones older than `ttl`
    pub fn prune_tombstones(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let cutoff = now - to_chrono(ttl);
        self.shards.iter().map(|s| s.prune_tombstones(cutoff)).sum()
    }

    /// Apply an event pushed by a peer, last writer wins
    pub fn apply_replicated(&self, event: RegistryEvent) -> Result<ReplicationOutcome> {
        let event = event.from_peer();
        let id = InstanceId::new(event.instance_id.clone());
        let shard = self.shard(&id);

        let outcome = {
            let mut state = shard.state.write();

            let newest_local = state
                .instances
                .get(&id)
                .map(|i| i.last_updated)
                .or_else(|| state.tombstones.get(&id).copied());
            if matches!(newest_local, Some(ts) if ts > event.timestamp) {
                None
            } else if event.kind.is_removal() {
                let removed = state.instances.remove(&id);
                state.tombstones.insert(id.clone(), event.timestamp);
                Some(removed.is_some())
            } else {
                let mut instance = event.instance.clone().ok_or_else(|| {
                    Error::Validation(format!(
                        "{} event for {} carries no instance",
                        event.kind, event.instance_id
                    ))
                })?;
                if instance.instance_id != id {
                    return Err(Error::Validation(format!(
                        "event instance id {} does not match payload {}",
                        id, instance.instance_id
                    )));
                }
                instance.last_updated = event.timestamp;
                state.tombstones.remove(&id);
                let is_new = state.instances.insert(id.clone(), instance).is_none();
                Some(is_new)
            }
        };

        let Some(changed_count) = outcome else {
            self.stats.replicated_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(instance_id = %id, kind = %event.kind, "Stale replicated event ignored");
            return Ok(ReplicationOutcome::Stale);
        };

        // `changed_count` is "removed" for removals and "inserted" for upserts
        if changed_count {
            if event.kind.is_removal() {
                shard.stats.instance_count.fetch_sub(1, Ordering::Relaxed);
                self.stats.total_instances.fetch_sub(1, Ordering::Relaxed);
            } else {
                shard.stats.instance_count.fetch_add(1, Ordering::Relaxed);
                self.stats.total_instances.fetch_add(1, Ordering::Relaxed);
            }
        }
        shard.stats.update_count.fetch_add(1, Ordering::Relaxed);
        self.stats.replicated_applied.fetch_add(1, Ordering::Relaxed);

        debug!(instance_id = %id, kind = %event.kind, "Replicated event applied");
        self.emit(event);

        Ok(ReplicationOutcome::Applied)
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        let now = self.clock.now();
        let up = self
            .shards
            .iter()
            .map(|s| {
                s.state
                    .read()
                    .instances
                    .values()
                    .filter(|i| self.is_serving(i, now))
                    .count() as u64
            })
            .sum();
        self.stats.snapshot(up)
    }

    /// Get shard statistics for debugging
    pub fn shard_stats(&self) -> Vec<(usize, usize, u64)> {
        self.shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| {
                (
                    idx,
                    shard.instance_count(),
                    shard.stats.update_count.load(Ordering::Relaxed),
                )
            })
            .filter(|(_, count, _)| *count > 0)
            .collect()
    }
}

impl std::fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryStore")
            .field("instances", &self.len())
            .finish()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::{Clock, ManualClock};
    use crate::registry::events::EventOrigin;
    use assert_matches::assert_matches;

    fn store_with_clock() -> (Arc<RegistryStore>, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let store = RegistryStore::with_clock(RegistryConfig::default(), clock.clone());
        (store, clock)
    }

    fn reg(id: &str, app: &str) -> InstanceRegistration {
        InstanceRegistration::new(id, app, "10.0.0.1", 8080)
    }

    #[test]
    fn test_register_is_idempotent_and_starts_starting() {
        let (store, _) = store_with_clock();

        let first = store.register(reg("svc-1", "orders")).unwrap();
        assert_eq!(first.status, InstanceStatus::Starting);
        store.renew("svc-1").unwrap();

        let second = store.register(reg("svc-1", "orders")).unwrap();
        assert_eq!(second.status, InstanceStatus::Starting);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().total_instances, 1);
        assert_eq!(store.stats().registrations, 2);
    }

    #[test]
    fn test_register_rejects_invalid_payload() {
        let (store, _) = store_with_clock();
        assert_matches!(store.register(reg("", "orders")), Err(Error::Validation(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_renew_unknown_is_not_found() {
        let (store, _) = store_with_clock();
        assert_matches!(store.renew("ghost"), Err(Error::NotFound { .. }));
    }

    #[test]
    fn test_lookup_returns_only_up_instances() {
        let (store, _) = store_with_clock();
        store.register(reg("svc-1", "orders")).unwrap();
        store.register(reg("svc-2", "orders")).unwrap();
        store.register(reg("svc-3", "billing")).unwrap();

        assert!(store.lookup("orders").is_empty());

        store.renew("svc-1").unwrap();
        store.renew("svc-2").unwrap();
        store.renew("svc-3").unwrap();
        store.set_status("svc-2", InstanceStatus::OutOfService).unwrap();

        let orders = store.lookup("orders");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].instance_id.as_str(), "svc-1");
        assert_eq!(store.lookup("billing").len(), 1);
        assert!(store.lookup("unknown").is_empty());
    }

    #[test]
    fn test_lapsed_lease_hidden_from_lookup_before_sweep() {
        let (store, clock) = store_with_clock();
        store.register(reg("svc-1", "orders")).unwrap();
        store.register(reg("svc-2", "orders")).unwrap();
        store.renew("svc-1").unwrap();
        store.renew("svc-2").unwrap();

        clock.advance(Duration::from_secs(90));
        store.renew("svc-2").unwrap();
        assert_eq!(store.lookup("orders").len(), 2);

        clock.advance(Duration::from_secs(1));
        let orders = store.lookup("orders");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].instance_id.as_str(), "svc-2");

        // Still in the table until a sweep evicts it
        assert!(store.contains("svc-1"));
        assert_eq!(store.applications()[0].up_instances, 1);
        assert_eq!(store.stats().up_instances, 1);

        store.renew("svc-1").unwrap();
        assert_eq!(store.lookup("orders").len(), 2);
    }

    #[test]
    fn test_down_instance_renewal_does_not_extend_lease() {
        let (store, clock) = store_with_clock();
        let registered = store.register(reg("svc-1", "orders")).unwrap();
        store.set_status("svc-1", InstanceStatus::Down).unwrap();

        clock.advance(Duration::from_secs(30));
        store.renew("svc-1").unwrap();

        let instance = store.get("svc-1").unwrap();
        assert_eq!(instance.last_renewal, registered.last_renewal);
        assert_eq!(instance.status, InstanceStatus::Down);
    }

    #[test]
    fn test_cancel_twice_is_noop() {
        let (store, _) = store_with_clock();
        let mut events = store.subscribe();
        store.register(reg("svc-1", "orders")).unwrap();

        assert!(store.cancel("svc-1"));
        let after_first = (store.len(), store.stats().total_instances, store.get("svc-1"));
        assert!(!store.cancel("svc-1"));
        let after_second = (store.len(), store.stats().total_instances, store.get("svc-1"));
        assert_eq!(after_first, after_second);

        assert_eq!(events.try_recv().unwrap().kind, RegistryEventKind::Register);
        assert_eq!(events.try_recv().unwrap().kind, RegistryEventKind::Cancel);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_every_mutation_emits_event() {
        let (store, _) = store_with_clock();
        let mut events = store.subscribe();

        store.register(reg("svc-1", "orders")).unwrap();
        store.renew("svc-1").unwrap();
        store.set_status("svc-1", InstanceStatus::OutOfService).unwrap();
        store.cancel("svc-1");

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                RegistryEventKind::Register,
                RegistryEventKind::Renew,
                RegistryEventKind::Status,
                RegistryEventKind::Cancel,
            ]
        );
    }

    #[test]
    fn test_evict_rechecks_lease_under_lock() {
        let (store, clock) = store_with_clock();
        let lease = Duration::from_secs(90);
        store.register(reg("svc-1", "orders")).unwrap();

        clock.advance(Duration::from_secs(91));
        let now = clock.now();
        let (total, expired) = store.expired_candidates(now, lease);
        assert_eq!((total, expired.len()), (1, 1));

        // A renew lands between candidate selection and eviction
        store.renew("svc-1").unwrap();
        assert!(!store.evict_if_expired(&expired[0], now, lease));
        assert!(store.contains("svc-1"));
    }

    #[test]
    fn test_replicated_last_writer_wins() {
        let clock = ManualClock::new();
        let local = RegistryStore::with_clock(RegistryConfig::default(), clock.clone());
        let remote = RegistryStore::with_clock(RegistryConfig::default(), clock.clone());

        let instance = remote.register(reg("svc-1", "orders")).unwrap();
        let older = RegistryEvent::upsert(RegistryEventKind::Register, &instance, instance.last_updated);

        clock.advance(Duration::from_secs(5));
        local.register(reg("svc-1", "orders")).unwrap();
        local.renew("svc-1").unwrap();

        assert_eq!(local.apply_replicated(older).unwrap(), ReplicationOutcome::Stale);
        assert_eq!(local.get("svc-1").unwrap().status, InstanceStatus::Up);
        assert_eq!(local.stats().replicated_ignored, 1);
    }

    #[test]
    fn test_replicated_cancel_tombstone_blocks_late_register() {
        let (store, clock) = store_with_clock();
        let t0 = clock.now();
        let instance = ServiceInstance::from_registration(reg("svc-9", "orders"), t0);

        let cancel = RegistryEvent::removal(RegistryEventKind::Cancel, &instance, t0 + chrono::Duration::seconds(10));
        assert_eq!(store.apply_replicated(cancel).unwrap(), ReplicationOutcome::Applied);

        let late = RegistryEvent::upsert(RegistryEventKind::Register, &instance, t0 + chrono::Duration::seconds(5));
        assert_eq!(store.apply_replicated(late).unwrap(), ReplicationOutcome::Stale);
        assert!(!store.contains("svc-9"));

        let newer = RegistryEvent::upsert(RegistryEventKind::Register, &instance, t0 + chrono::Duration::seconds(20));
        assert_eq!(store.apply_replicated(newer).unwrap(), ReplicationOutcome::Applied);
        assert!(store.contains("svc-9"));
        assert_eq!(store.stats().total_instances, 1);
    }

    #[test]
    fn test_replicated_events_are_marked_peer() {
        let (store, clock) = store_with_clock();
        let mut events = store.subscribe();
        let instance = ServiceInstance::from_registration(reg("svc-1", "orders"), clock.now());
        let event = RegistryEvent::upsert(RegistryEventKind::Register, &instance, clock.now());

        store.apply_replicated(event).unwrap();
        assert_eq!(events.try_recv().unwrap().origin, EventOrigin::Peer);
    }

    #[test]
    fn test_replicated_upsert_without_payload_is_rejected() {
        let (store, clock) = store_with_clock();
        let instance = ServiceInstance::from_registration(reg("svc-1", "orders"), clock.now());
        let mut event = RegistryEvent::upsert(RegistryEventKind::Register, &instance, clock.now());
        event.instance = None;
        assert_matches!(store.apply_replicated(event), Err(Error::Validation(_)));
    }

    #[test]
    fn test_prune_tombstones() {
        let (store, clock) = store_with_clock();
        store.register(reg("svc-1", "orders")).unwrap();
        store.cancel("svc-1");

        assert_eq!(store.prune_tombstones(clock.now(), Duration::from_secs(90)), 0);
        clock.advance(Duration::from_secs(91));
        assert_eq!(store.prune_tombstones(clock.now(), Duration::from_secs(90)), 1);
    }

    #[test]
    fn test_applications_summary() {
        let (store, _) = store_with_clock();
        store.register(reg("svc-1", "orders")).unwrap();
        store.register(reg("svc-2", "orders")).unwrap();
        store.register(reg("svc-3", "billing")).unwrap();
        store.renew("svc-1").unwrap();

        let apps = store.applications();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].app_name, "billing");
        assert_eq!(apps[1].instances, 2);
        assert_eq!(apps[1].up_instances, 1);
    }
}
