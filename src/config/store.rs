//! Config Snapshot Store
//!
//! Versioned configuration history per (application, profile, label).
//!
//! Publishes on one key are serialized by a per-key async mutex so versions
//! come out as 1, 2, 3, ... with no gaps. Each new version is written to the
//! backend before it becomes visible. Readers clone an `Arc` of the current
//! immutable history and never wait on a publish.

use super::backend::SharedBackend;
use super::notifier::{ConfigChangeNotifier, SubscriptionHandle};
use super::snapshot::{
    validate_entries, ConfigChange, ConfigEntries, ConfigKey, ConfigSnapshot, DEFAULT_PROFILE,
    SHARED_APPLICATION,
};
use crate::domain::clock::SharedClock;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    /// Versions kept per key
    pub retention: usize,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self { retention: 10 }
    }
}

// =============================================================================
// History
// =============================================================================

/// Immutable retained history of one key
#[derive(Debug, Clone, Default)]
struct VersionHistory {
    versions: BTreeMap<u64, Arc<ConfigSnapshot>>,
    /// Highest version ever published, even if purged
    latest: u64,
}

impl VersionHistory {
    fn latest_snapshot(&self) -> Option<&Arc<ConfigSnapshot>> {
        self.versions.get(&self.latest)
    }

    /// Drop versions beyond the retention window; returns the first kept
    fn apply_retention(&mut self, retention: usize) -> Option<u64> {
        let retention = retention.max(1);
        if self.versions.len() <= retention {
            return None;
        }
        let keep_from = *self.versions.keys().rev().nth(retention - 1)?;
        self.versions = self.versions.split_off(&keep_from);
        Some(keep_from)
    }
}

struct KeyState {
    publish_lock: AsyncMutex<()>,
    history: RwLock<Arc<VersionHistory>>,
}

impl KeyState {
    fn new(history: VersionHistory) -> Self {
        Self {
            publish_lock: AsyncMutex::new(()),
            history: RwLock::new(Arc::new(history)),
        }
    }

    fn current(&self) -> Arc<VersionHistory> {
        self.history.read().clone()
    }
}

// =============================================================================
// Public Views
// =============================================================================

/// Summary of one known key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub application: String,
    pub profile: String,
    pub label: String,
    pub latest_version: u64,
    pub retained_versions: Vec<u64>,
}

/// One layer of a resolved environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySource {
    /// `application/profile/label`
    pub name: String,
    pub version: u64,
    pub source: ConfigEntries,
}

/// Configuration resolved for an application and its active profiles
///
/// Property sources are ordered highest precedence first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub name: String,
    pub profiles: Vec<String>,
    pub label: String,
    pub property_sources: Vec<PropertySource>,
}

impl Environment {
    /// Flatten the layers; the first source defining a key wins
    pub fn properties(&self) -> ConfigEntries {
        let mut merged = ConfigEntries::new();
        for source in &self.property_sources {
            for (k, v) in &source.source {
                if !merged.contains_key(k) {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
    }
}

#[derive(Debug, Default)]
struct StoreStats {
    publishes: AtomicU64,
    conflicts: AtomicU64,
    failed_publishes: AtomicU64,
    purged: AtomicU64,
}

/// Snapshot of store counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStoreStatsSnapshot {
    pub keys: usize,
    pub publishes: u64,
    pub conflicts: u64,
    pub failed_publishes: u64,
    pub purged: u64,
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Versioned, durable configuration store
pub struct ConfigSnapshotStore {
    config: SnapshotStoreConfig,
    histories: DashMap<ConfigKey, Arc<KeyState>>,
    backend: SharedBackend,
    notifier: Arc<ConfigChangeNotifier>,
    clock: SharedClock,
    stats: StoreStats,
}

impl ConfigSnapshotStore {
    /// Open the store, loading retained history from the backend
    pub async fn open(
        config: SnapshotStoreConfig,
        backend: SharedBackend,
        notifier: Arc<ConfigChangeNotifier>,
        clock: SharedClock,
    ) -> Result<Arc<Self>> {
        let loaded = backend.load_all().await?;
        let loaded_count = loaded.len();

        let mut grouped: BTreeMap<ConfigKey, VersionHistory> = BTreeMap::new();
        for snapshot in loaded {
            let history = grouped.entry(snapshot.key()).or_default();
            history.latest = history.latest.max(snapshot.version);
            history.versions.insert(snapshot.version, Arc::new(snapshot));
        }

        let histories = DashMap::new();
        for (key, mut history) in grouped {
            history.apply_retention(config.retention);
            histories.insert(key, Arc::new(KeyState::new(history)));
        }

        info!(
            backend = backend.name(),
            keys = histories.len(),
            snapshots = loaded_count,
            retention = config.retention,
            "Config snapshot store opened"
        );

        Ok(Arc::new(Self {
            config,
            histories,
            backend,
            notifier,
            clock,
            stats: StoreStats::default(),
        }))
    }

    pub fn notifier(&self) -> &Arc<ConfigChangeNotifier> {
        &self.notifier
    }

    fn key_state(&self, key: &ConfigKey) -> Arc<KeyState> {
        if let Some(state) = self.histories.get(key) {
            return state.clone();
        }
        self.histories
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyState::new(VersionHistory::default())))
            .clone()
    }

    fn history(&self, key: &ConfigKey) -> Option<Arc<VersionHistory>> {
        self.histories.get(key).map(|state| state.current())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Highest version for the key
    pub fn get_latest(&self, key: &ConfigKey) -> Result<Arc<ConfigSnapshot>> {
        key.validate()?;
        self.history(key)
            .and_then(|h| h.latest_snapshot().cloned())
            .ok_or_else(|| Error::not_found("ConfigSnapshot", key.to_string()))
    }

    /// Exact version; `NotFound` if never published or purged
    pub fn get_version(&self, key: &ConfigKey, version: u64) -> Result<Arc<ConfigSnapshot>> {
        key.validate()?;
        self.history(key)
            .and_then(|h| h.versions.get(&version).cloned())
            .ok_or_else(|| Error::not_found("ConfigSnapshot", format!("{}@{}", key, version)))
    }

    /// Retained versions for the key, ascending
    pub fn retained_versions(&self, key: &ConfigKey) -> Vec<u64> {
        self.history(key)
            .map(|h| h.versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every key with at least one published version
    pub fn list_keys(&self) -> Vec<KeySummary> {
        let mut keys: Vec<KeySummary> = self
            .histories
            .iter()
            .filter_map(|entry| {
                let history = entry.value().current();
                if history.latest == 0 {
                    return None;
                }
                let key = entry.key();
                Some(KeySummary {
                    application: key.application.clone(),
                    profile: key.profile.clone(),
                    label: key.label.clone(),
                    latest_version: history.latest,
                    retained_versions: history.versions.keys().copied().collect(),
                })
            })
            .collect();
        keys.sort_by(|a, b| {
            (&a.application, &a.profile, &a.label).cmp(&(&b.application, &b.profile, &b.label))
        });
        keys
    }

    /// Resolve the layered environment for an application
    ///
    /// Layers, highest precedence first: `{app}/{profile}` (later profiles
    /// win), `{app}/default`, then the same for the shared `application`
    /// name. Missing layers are skipped; if none exist the read fails.
    pub fn environment(&self, application: &str, profiles: &[String], label: &str) -> Result<Environment> {
        let profiles: Vec<String> = if profiles.is_empty() {
            vec![DEFAULT_PROFILE.to_string()]
        } else {
            profiles.to_vec()
        };

        let mut candidates = Vec::new();
        for app in [application, SHARED_APPLICATION] {
            for profile in profiles.iter().rev() {
                candidates.push(ConfigKey::new(app, profile.as_str(), label));
            }
            candidates.push(ConfigKey::new(app, DEFAULT_PROFILE, label));
        }

        let mut seen = HashSet::new();
        let mut property_sources = Vec::new();
        for key in candidates {
            if !seen.insert(key.clone()) {
                continue;
            }
            key.validate()?;
            if let Some(snapshot) = self.history(&key).and_then(|h| h.latest_snapshot().cloned()) {
                property_sources.push(PropertySource {
                    name: key.to_string(),
                    version: snapshot.version,
                    source: snapshot.entries.clone(),
                });
            }
        }

        if property_sources.is_empty() {
            return Err(Error::not_found(
                "Environment",
                format!("{}/{}/{}", application, profiles.join(","), label),
            ));
        }

        Ok(Environment {
            name: application.to_string(),
            profiles,
            label: label.to_string(),
            property_sources,
        })
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish a new version
    pub async fn publish(&self, key: &ConfigKey, entries: ConfigEntries) -> Result<Arc<ConfigSnapshot>> {
        self.publish_inner(key, entries, None).await
    }

    /// Publish only if the latest version is still `expected_latest`
    ///
    /// `expected_latest` of 0 means "no version published yet".
    pub async fn publish_expecting(
        &self,
        key: &ConfigKey,
        entries: ConfigEntries,
        expected_latest: u64,
    ) -> Result<Arc<ConfigSnapshot>> {
        self.publish_inner(key, entries, Some(expected_latest)).await
    }

    async fn publish_inner(
        &self,
        key: &ConfigKey,
        entries: ConfigEntries,
        expected_latest: Option<u64>,
    ) -> Result<Arc<ConfigSnapshot>> {
        key.validate()?;
        validate_entries(&entries)?;

        let state = self.key_state(key);
        let guard = state.publish_lock.lock().await;
        let current = state.current();

        if let Some(expected) = expected_latest {
            if current.latest != expected {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Conflict {
                    resource: key.to_string(),
                    expected,
                    actual: current.latest,
                });
            }
        }

        let version = current.latest + 1;
        let snapshot = Arc::new(ConfigSnapshot {
            application: key.application.clone(),
            profile: key.profile.clone(),
            label: key.label.clone(),
            version,
            entries,
            created_at: self.clock.now(),
        });

        if let Err(e) = self.backend.persist(&snapshot).await {
            if matches!(e, Error::Conflict { .. }) {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.failed_publishes.fetch_add(1, Ordering::Relaxed);
            }
            warn!(key = %key, version, backend = self.backend.name(), error = %e, "Config publish not persisted");
            return Err(e);
        }

        let mut next = (*current).clone();
        next.versions.insert(version, snapshot.clone());
        next.latest = version;
        let purge_from = next.apply_retention(self.config.retention);
        *state.history.write() = Arc::new(next);

        self.stats.publishes.fetch_add(1, Ordering::Relaxed);
        let notified = self.notifier.notify(&ConfigChange::with_snapshot(snapshot.clone()));
        drop(guard);

        info!(key = %key, version, entries = snapshot.entries.len(), notified, "Config published");

        if let Some(keep_from) = purge_from {
            match self.backend.purge(key, keep_from).await {
                Ok(purged) => {
                    self.stats.purged.fetch_add(purged as u64, Ordering::Relaxed);
                    debug!(key = %key, keep_from, purged, "Purged old config versions");
                }
                // Retried implicitly on the next publish
                Err(e) => warn!(key = %key, keep_from, error = %e, "Failed to purge old config versions"),
            }
        }

        Ok(snapshot)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe to changes of a key
    ///
    /// Every retained version above `last_seen_version` is queued right
    /// away; purged ones are queued as payload-less notifications. `None`
    /// starts from the current latest version.
    pub async fn subscribe(
        &self,
        client_id: impl Into<String>,
        key: &ConfigKey,
        last_seen_version: Option<u64>,
    ) -> Result<SubscriptionHandle> {
        key.validate()?;

        // Unknown keys get no history entry; the subscription is registered
        // while the map entry is locked so a first publish cannot slip past it
        let existing = self.histories.get(key).map(|state| state.clone());
        let state = match existing {
            Some(state) => state,
            None => match self.histories.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(_vacant) => {
                    let last_seen = last_seen_version.unwrap_or(0);
                    return Ok(self.notifier.subscribe(client_id, key.clone(), last_seen, Vec::new()));
                }
            },
        };
        let _guard = state.publish_lock.lock().await;
        let history = state.current();

        let last_seen = last_seen_version.unwrap_or(history.latest);
        let backlog: Vec<ConfigChange> = (last_seen.saturating_add(1)..=history.latest)
            .map(|version| match history.versions.get(&version) {
                Some(snapshot) => ConfigChange::with_snapshot(snapshot.clone()),
                None => ConfigChange::purged(key, version),
            })
            .collect();

        Ok(self.notifier.subscribe(client_id, key.clone(), last_seen, backlog))
    }

    pub async fn health_check(&self) -> Result<bool> {
        self.backend.health_check().await
    }

    pub fn stats(&self) -> SnapshotStoreStatsSnapshot {
        SnapshotStoreStatsSnapshot {
            keys: self.list_keys().len(),
            publishes: self.stats.publishes.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            failed_publishes: self.stats.failed_publishes.load(Ordering::Relaxed),
            purged: self.stats.purged.load(Ordering::Relaxed),
        }
    }
}
