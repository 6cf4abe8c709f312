//! Configuration Snapshots
//!
//! Immutable, versioned key/value sets addressed by
//! (application, profile, label).

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ordered configuration entries
pub type ConfigEntries = IndexMap<String, String>;

/// Application name whose snapshots apply to every application
pub const SHARED_APPLICATION: &str = "application";

/// Profile used when none is active
pub const DEFAULT_PROFILE: &str = "default";

/// Label used when none is given
pub const DEFAULT_LABEL: &str = "main";

// =============================================================================
// Config Key
// =============================================================================

/// Address of one configuration history
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub application: String,
    pub profile: String,
    pub label: String,
}

impl ConfigKey {
    pub fn new(
        application: impl Into<String>,
        profile: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            profile: profile.into(),
            label: label.into(),
        }
    }

    /// Build and validate
    pub fn parse(application: &str, profile: &str, label: &str) -> Result<Self> {
        let key = Self::new(application, profile, label);
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("application", &self.application),
            ("profile", &self.profile),
            ("label", &self.label),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", field)));
            }
            if value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(Error::Validation(format!("invalid {}: {}", field, value)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.application, self.profile, self.label)
    }
}

// =============================================================================
// Config Snapshot
// =============================================================================

/// One immutable version of a configuration set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub application: String,
    pub profile: String,
    pub label: String,
    pub version: u64,
    pub entries: ConfigEntries,
    pub created_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(&self.application, &self.profile, &self.label)
    }

    pub fn matches(&self, key: &ConfigKey) -> bool {
        self.application == key.application && self.profile == key.profile && self.label == key.label
    }
}

/// Reject entries that cannot be addressed
pub fn validate_entries(entries: &ConfigEntries) -> Result<()> {
    if let Some(bad) = entries.keys().find(|k| k.trim().is_empty()) {
        return Err(Error::Validation(format!("config key must not be blank: {:?}", bad)));
    }
    Ok(())
}

// =============================================================================
// Change Notification
// =============================================================================

/// Notification that a new version exists
///
/// `snapshot` is `None` when the version was purged by retention before
/// it could be delivered; the subscriber should re-read the latest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChange {
    pub application: String,
    pub profile: String,
    pub label: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Arc<ConfigSnapshot>>,
}

impl ConfigChange {
    pub fn with_snapshot(snapshot: Arc<ConfigSnapshot>) -> Self {
        Self {
            application: snapshot.application.clone(),
            profile: snapshot.profile.clone(),
            label: snapshot.label.clone(),
            version: snapshot.version,
            snapshot: Some(snapshot),
        }
    }

    pub fn purged(key: &ConfigKey, version: u64) -> Self {
        Self {
            application: key.application.clone(),
            profile: key.profile.clone(),
            label: key.label.clone(),
            version,
            snapshot: None,
        }
    }
}
