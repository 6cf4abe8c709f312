//! File snapshot backend
//!
//! One JSON document per version under
//! `root/{application}/{profile}/{label}/{version}.json`. Versions are
//! written to a temporary file and renamed into place, so a reader never
//! sees a partial document.

use crate::config::snapshot::{ConfigKey, ConfigSnapshot};
use crate::domain::ports::SnapshotBackend;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const SNAPSHOT_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Configuration for the file backend
#[derive(Debug, Clone)]
pub struct FileBackendConfig {
    /// Root directory for snapshot files
    pub root_path: PathBuf,
    /// Whether to fsync each version before renaming
    pub sync_writes: bool,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/registry-config-server/config"),
            sync_writes: true,
        }
    }
}

/// Durable backend on the local filesystem
#[derive(Debug)]
pub struct FileBackend {
    root_path: PathBuf,
    sync_writes: bool,
}

impl FileBackend {
    /// Open (and create) the backend root
    pub async fn open(config: FileBackendConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_path)
            .await
            .map_err(|e| unavailable(&config.root_path, e))?;
        Ok(Self {
            root_path: config.root_path,
            sync_writes: config.sync_writes,
        })
    }

    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(FileBackendConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn key_dir(&self, key: &ConfigKey) -> PathBuf {
        self.root_path
            .join(&key.application)
            .join(&key.profile)
            .join(&key.label)
    }

    fn version_path(&self, key: &ConfigKey, version: u64) -> PathBuf {
        self.key_dir(key)
            .join(format!("{:020}.{}", version, SNAPSHOT_EXTENSION))
    }

    /// Version encoded in a snapshot file name
    fn parse_version(path: &Path) -> Option<u64> {
        if path.extension()? != SNAPSHOT_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    async fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(unavailable(dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(dir, e))? {
            let path = entry.path();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    async fn version_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(unavailable(dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(dir, e))? {
            let path = entry.path();
            if let Some(version) = Self::parse_version(&path) {
                files.push((version, path));
            }
        }
        files.sort_by_key(|(v, _)| *v);
        Ok(files)
    }
}

fn unavailable(path: &Path, error: impl ToString) -> Error {
    Error::unavailable(format!("file backend ({})", path.display()), error)
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn load_all(&self) -> Result<Vec<ConfigSnapshot>> {
        let mut snapshots = Vec::new();

        for app_dir in Self::subdirs(&self.root_path).await? {
            for profile_dir in Self::subdirs(&app_dir).await? {
                for label_dir in Self::subdirs(&profile_dir).await? {
                    for (version, path) in Self::version_files(&label_dir).await? {
                        let raw = fs::read(&path).await.map_err(|e| unavailable(&path, e))?;
                        match serde_json::from_slice::<ConfigSnapshot>(&raw) {
                            Ok(snapshot) if snapshot.version == version => snapshots.push(snapshot),
                            Ok(snapshot) => warn!(
                                path = %path.display(),
                                file_version = version,
                                stored_version = snapshot.version,
                                "Snapshot file name does not match its version, skipping"
                            ),
                            Err(e) => warn!(path = %path.display(), error = %e, "Unreadable snapshot file, skipping"),
                        }
                    }
                }
            }
        }

        debug!(root = %self.root_path.display(), count = snapshots.len(), "Loaded config snapshots");
        Ok(snapshots)
    }

    async fn persist(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let key = snapshot.key();
        let dir = self.key_dir(&key);
        let final_path = self.version_path(&key, snapshot.version);

        fs::create_dir_all(&dir).await.map_err(|e| unavailable(&dir, e))?;

        if fs::try_exists(&final_path).await.map_err(|e| unavailable(&final_path, e))? {
            return Err(Error::Conflict {
                resource: key.to_string(),
                expected: snapshot.version.saturating_sub(1),
                actual: snapshot.version,
            });
        }

        let body = serde_json::to_vec_pretty(snapshot)?;
        let temp_path = final_path.with_extension(TEMP_EXTENSION);
        {
            let mut file = fs::File::create(&temp_path)
                .await
                .map_err(|e| unavailable(&temp_path, e))?;
            file.write_all(&body).await.map_err(|e| unavailable(&temp_path, e))?;
            if self.sync_writes {
                file.sync_all().await.map_err(|e| unavailable(&temp_path, e))?;
            }
        }

        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(unavailable(&final_path, e));
        }

        debug!(key = %key, version = snapshot.version, "Persisted config snapshot");
        Ok(())
    }

    async fn purge(&self, key: &ConfigKey, keep_from: u64) -> Result<usize> {
        let mut removed = 0;
        for (version, path) in Self::version_files(&self.key_dir(key)).await? {
            if version >= keep_from {
                break;
            }
            fs::remove_file(&path).await.map_err(|e| unavailable(&path, e))?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        match fs::metadata(&self.root_path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::snapshot::ConfigEntries;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot(version: u64, value: &str) -> ConfigSnapshot {
        let mut entries = ConfigEntries::new();
        entries.insert("db.url".into(), value.into());
        ConfigSnapshot {
            application: "orders".into(),
            profile: "prod".into(),
            label: "main".into(),
            version,
            entries,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::with_path(dir.path()).await.unwrap();

        backend.persist(&snapshot(1, "postgres://a")).await.unwrap();
        backend.persist(&snapshot(2, "postgres://b")).await.unwrap();

        let expected = dir.path().join("orders/prod/main").join(format!("{:020}.json", 2));
        assert!(expected.exists());

        let reopened = FileBackend::with_path(dir.path()).await.unwrap();
        let mut loaded = reopened.load_all().await.unwrap();
        loaded.sort_by_key(|s| s.version);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].entries["db.url"], "postgres://b");
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::with_path(dir.path()).await.unwrap();

        backend.persist(&snapshot(1, "a")).await.unwrap();
        assert_matches!(backend.persist(&snapshot(1, "b")).await, Err(Error::Conflict { .. }));

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded[0].entries["db.url"], "a");
    }

    #[tokio::test]
    async fn test_purge_removes_older_versions() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::with_path(dir.path()).await.unwrap();
        for v in 1..=4 {
            backend.persist(&snapshot(v, "x")).await.unwrap();
        }

        let key = ConfigKey::new("orders", "prod", "main");
        assert_eq!(backend.purge(&key, 3).await.unwrap(), 2);
        let versions: Vec<u64> = backend.load_all().await.unwrap().iter().map(|s| s.version).collect();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().all(|v| *v >= 3));
    }

    #[tokio::test]
    async fn test_garbage_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::with_path(dir.path()).await.unwrap();
        backend.persist(&snapshot(1, "x")).await.unwrap();

        let key_dir = dir.path().join("orders/prod/main");
        std::fs::write(key_dir.join(format!("{:020}.json", 7)), b"not json").unwrap();
        std::fs::write(key_dir.join("notes.txt"), b"hello").unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(backend.health_check().await.unwrap());
    }
}
