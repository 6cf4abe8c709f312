//! File configuration source
//!
//! Polls a directory of YAML files and publishes a new snapshot whenever a
//! file's content changes. Layout:
//!
//! ```text
//! config-repo/
//! ├── application.yml        -> application/default
//! ├── orders.yml             -> orders/default
//! └── orders/
//!     ├── prod.yml           -> orders/prod
//!     └── staging.yaml       -> orders/staging
//! ```
//!
//! Nested YAML is flattened to dotted keys (`server.port`) and sequences to
//! indexed keys (`hosts[0]`).

use super::snapshot::{ConfigEntries, ConfigKey, DEFAULT_LABEL, DEFAULT_PROFILE};
use super::store::ConfigSnapshotStore;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the file source
#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    /// Directory to scan
    pub dir: PathBuf,
    /// Label snapshots are published under
    pub label: String,
    /// Time between scans
    pub poll_interval: Duration,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/registry-config-server/repo"),
            label: DEFAULT_LABEL.to_string(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutcome {
    pub published: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Directory-backed upstream for the snapshot store
pub struct FileConfigSource {
    config: FileSourceConfig,
    store: Arc<ConfigSnapshotStore>,
}

impl FileConfigSource {
    pub fn new(config: FileSourceConfig, store: Arc<ConfigSnapshotStore>) -> Arc<Self> {
        Arc::new(Self { config, store })
    }

    fn is_yaml(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        )
    }

    fn stem(path: &Path) -> Option<String> {
        path.file_stem()?.to_str().map(str::to_string)
    }

    /// Map files to the keys they feed
    async fn discover(&self) -> Result<BTreeMap<ConfigKey, PathBuf>> {
        let label = self.config.label.as_str();
        let mut found = BTreeMap::new();

        let mut entries = fs::read_dir(&self.config.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_file() && Self::is_yaml(&path) {
                if let Some(app) = Self::stem(&path) {
                    found.insert(ConfigKey::new(app, DEFAULT_PROFILE, label), path);
                }
            } else if file_type.is_dir() {
                let Some(app) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                    continue;
                };
                let mut profiles = fs::read_dir(&path).await?;
                while let Some(profile_entry) = profiles.next_entry().await? {
                    let profile_path = profile_entry.path();
                    if !Self::is_yaml(&profile_path) {
                        continue;
                    }
                    if let Some(profile) = Self::stem(&profile_path) {
                        let key = ConfigKey::new(app.as_str(), profile, label);
                        if let Some(previous) = found.insert(key.clone(), profile_path.clone()) {
                            warn!(
                                key = %key,
                                used = %profile_path.display(),
                                ignored = %previous.display(),
                                "Two files map to the same config key"
                            );
                        }
                    }
                }
            }
        }

        Ok(found)
    }

    async fn load(path: &Path) -> Result<ConfigEntries> {
        let raw = fs::read_to_string(path).await?;
        let value: Value = serde_yaml::from_str(&raw)?;
        flatten_yaml(&value)
    }

    /// Scan the directory once, publishing changed files
    pub async fn scan_once(&self) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();

        for (key, path) in self.discover().await? {
            if let Err(e) = key.validate() {
                warn!(path = %path.display(), error = %e, "Skipping config file with invalid name");
                outcome.failed += 1;
                continue;
            }

            let entries = match Self::load(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable config file");
                    outcome.failed += 1;
                    continue;
                }
            };

            if let Ok(latest) = self.store.get_latest(&key) {
                if latest.entries == entries {
                    outcome.unchanged += 1;
                    continue;
                }
            }

            match self.store.publish(&key, entries).await {
                Ok(snapshot) => {
                    debug!(key = %key, version = snapshot.version, path = %path.display(), "Published from file");
                    outcome.published += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to publish config file");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Poll until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            dir = %self.config.dir.display(),
            label = %self.config.label,
            interval_secs = self.config.poll_interval.as_secs(),
            "File config source started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match self.scan_once().await {
                        Ok(outcome) if outcome.published > 0 || outcome.failed > 0 => {
                            info!(
                                published = outcome.published,
                                unchanged = outcome.unchanged,
                                failed = outcome.failed,
                                "Config source scan complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(dir = %self.config.dir.display(), error = %e, "Config source scan failed"),
                    }
                }
            }
        }

        info!("File config source stopped");
    }
}

// =============================================================================
// YAML Flattening
// =============================================================================

/// Flatten a YAML document into dotted keys
pub fn flatten_yaml(value: &Value) -> Result<ConfigEntries> {
    let mut entries = ConfigEntries::new();
    match value {
        Value::Null => {}
        Value::Mapping(_) => flatten_into(&mut entries, "", value)?,
        Value::Tagged(tagged) => return flatten_yaml(&tagged.value),
        _ => {
            return Err(Error::Validation(
                "config document must be a mapping".to_string(),
            ))
        }
    }
    Ok(entries)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn flatten_into(entries: &mut ConfigEntries, prefix: &str, value: &Value) -> Result<()> {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let name = scalar_to_string(k)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| Error::Validation(format!("unsupported key under '{}'", prefix)))?;
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{}.{}", prefix, name)
                };
                flatten_into(entries, &path, v)?;
            }
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(entries, &format!("{}[{}]", prefix, i), item)?;
            }
        }
        Value::Tagged(tagged) => flatten_into(entries, prefix, &tagged.value)?,
        scalar => {
            if let Some(s) = scalar_to_string(scalar) {
                entries.insert(prefix.to_string(), s);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::backend::MemoryBackend;
    use crate::config::notifier::{ConfigChangeNotifier, NotifierConfig};
    use crate::config::store::SnapshotStoreConfig;
    use crate::domain::clock::system_clock;
    use tempfile::TempDir;

    #[test]
    fn test_flatten_nested_yaml() {
        let doc: Value = serde_yaml::from_str(
            r#"
server:
  port: 8080
  ssl: false
hosts:
  - a.internal
  - b.internal
feature:
  flags:
    - name: beta
      enabled: true
empty:
"#,
        )
        .unwrap();

        let entries = flatten_yaml(&doc).unwrap();
        assert_eq!(entries["server.port"], "8080");
        assert_eq!(entries["server.ssl"], "false");
        assert_eq!(entries["hosts[1]"], "b.internal");
        assert_eq!(entries["feature.flags[0].name"], "beta");
        assert_eq!(entries["feature.flags[0].enabled"], "true");
        assert_eq!(entries["empty"], "");
        // Document order is kept
        assert_eq!(entries.keys().next().map(String::as_str), Some("server.port"));
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let doc: Value = serde_yaml::from_str("- a\n- b\n").unwrap();
        assert!(flatten_yaml(&doc).is_err());
    }

    async fn store() -> Arc<ConfigSnapshotStore> {
        let notifier = ConfigChangeNotifier::new(NotifierConfig::default(), system_clock());
        ConfigSnapshotStore::open(
            SnapshotStoreConfig::default(),
            Arc::new(MemoryBackend::new()),
            notifier,
            system_clock(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_scan_publishes_only_changes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("application.yml"), "log:\n  level: info\n").unwrap();
        std::fs::create_dir(dir.path().join("orders")).unwrap();
        std::fs::write(dir.path().join("orders/prod.yml"), "db:\n  url: prod-db\n").unwrap();
        std::fs::write(dir.path().join("orders/broken.yml"), "db: [unclosed\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let store = store().await;
        let source = FileConfigSource::new(
            FileSourceConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            store.clone(),
        );

        let first = source.scan_once().await.unwrap();
        assert_eq!(first, ScanOutcome { published: 2, unchanged: 0, failed: 1 });

        let orders = ConfigKey::new("orders", "prod", "main");
        assert_eq!(store.get_latest(&orders).unwrap().entries["db.url"], "prod-db");
        assert!(store
            .get_latest(&ConfigKey::new("application", "default", "main"))
            .is_ok());

        let second = source.scan_once().await.unwrap();
        assert_eq!(second.published, 0);
        assert_eq!(second.unchanged, 2);

        std::fs::write(dir.path().join("orders/prod.yml"), "db:\n  url: prod-db-2\n").unwrap();
        source.scan_once().await.unwrap();
        let latest = store.get_latest(&orders).unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.entries["db.url"], "prod-db-2");
    }
}
