//! In-memory snapshot backend
//!
//! Volatile; used in tests and when no config directory is configured.
//! Can be switched unavailable to exercise failure paths.

use crate::config::snapshot::{ConfigKey, ConfigSnapshot};
use crate::domain::ports::SnapshotBackend;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Backend that keeps every version in a map
#[derive(Debug)]
pub struct MemoryBackend {
    snapshots: RwLock<BTreeMap<ConfigKey, BTreeMap<u64, ConfigSnapshot>>>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored versions for a key
    pub fn version_count(&self, key: &ConfigKey) -> usize {
        self.snapshots.read().get(key).map(|v| v.len()).unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable("memory backend", "backend offline"))
        }
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_all(&self) -> Result<Vec<ConfigSnapshot>> {
        self.ensure_available()?;
        Ok(self
            .snapshots
            .read()
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect())
    }

    async fn persist(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        self.ensure_available()?;
        let mut snapshots = self.snapshots.write();
        let versions = snapshots.entry(snapshot.key()).or_default();
        if versions.contains_key(&snapshot.version) {
            let latest = versions.keys().next_back().copied().unwrap_or(snapshot.version);
            return Err(Error::Conflict {
                resource: snapshot.key().to_string(),
                expected: snapshot.version.saturating_sub(1),
                actual: latest,
            });
        }
        versions.insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn purge(&self, key: &ConfigKey, keep_from: u64) -> Result<usize> {
        self.ensure_available()?;
        let mut snapshots = self.snapshots.write();
        let Some(versions) = snapshots.get_mut(key) else {
            return Ok(0);
        };
        let kept = versions.split_off(&keep_from);
        let removed = versions.len();
        *versions = kept;
        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::snapshot::ConfigEntries;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn snapshot(version: u64) -> ConfigSnapshot {
        ConfigSnapshot {
            application: "orders".into(),
            profile: "prod".into(),
            label: "main".into(),
            version,
            entries: ConfigEntries::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let backend = MemoryBackend::new();
        backend.persist(&snapshot(1)).await.unwrap();
        assert_matches!(backend.persist(&snapshot(1)).await, Err(Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_purge_and_outage() {
        let backend = MemoryBackend::new();
        for v in 1..=5 {
            backend.persist(&snapshot(v)).await.unwrap();
        }
        let key = snapshot(1).key();
        assert_eq!(backend.purge(&key, 4).await.unwrap(), 3);
        assert_eq!(backend.version_count(&key), 2);

        backend.set_available(false);
        assert!(!backend.health_check().await.unwrap());
        assert_matches!(backend.persist(&snapshot(6)).await, Err(Error::Unavailable { .. }));
    }
}
