//! Service Instance Model
//!
//! Identity, status and lease bookkeeping for one registered instance.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Number of shards in the registry (256 for good distribution)
pub const REGISTRY_SHARD_COUNT: usize = 256;

// =============================================================================
// Instance ID
// =============================================================================

/// Unique identifier for a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the shard index for this instance ID
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for InstanceId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

// =============================================================================
// Instance Status
// =============================================================================

/// Lifecycle status reported for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
    OutOfService,
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "STARTING"),
            InstanceStatus::Up => write!(f, "UP"),
            InstanceStatus::Down => write!(f, "DOWN"),
            InstanceStatus::OutOfService => write!(f, "OUT_OF_SERVICE"),
            InstanceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(InstanceStatus::Starting),
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(Error::Validation(format!("unknown instance status: {}", other))),
        }
    }
}

// =============================================================================
// Registration Request
// =============================================================================

/// Payload an instance sends to register itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRegistration {
    pub instance_id: String,
    pub app_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl InstanceRegistration {
    pub fn new(
        instance_id: impl Into<String>,
        app_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            app_name: app_name.into(),
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
        }
    }

    /// Reject malformed registrations before they reach the store
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(Error::Validation("instanceId must not be empty".into()));
        }
        if self.instance_id.contains('/') {
            return Err(Error::Validation(format!(
                "instanceId must not contain '/': {}",
                self.instance_id
            )));
        }
        if self.app_name.trim().is_empty() {
            return Err(Error::Validation("appName must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Validation("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Validation("port must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Service Instance
// =============================================================================

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub instance_id: InstanceId,
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    /// Last successful lease renewal
    pub last_renewal: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Timestamp of the last applied mutation, used for last-writer-wins
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    /// Build a freshly registered instance in `STARTING`
    pub fn from_registration(registration: InstanceRegistration, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: InstanceId(registration.instance_id),
            app_name: registration.app_name,
            host: registration.host,
            port: registration.port,
            status: InstanceStatus::Starting,
            last_renewal: now,
            registered_at: now,
            last_updated: now,
            metadata: registration.metadata,
        }
    }

    /// Record a heartbeat
    ///
    /// Returns false when the instance is DOWN and its lease was left alone.
    pub fn renew(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == InstanceStatus::Down {
            return false;
        }
        if self.status == InstanceStatus::Starting {
            self.status = InstanceStatus::Up;
        }
        self.last_renewal = now;
        self.last_updated = now;
        true
    }

    /// Whether the lease lapsed at `now`
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_renewal) > lease
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// `host:port` address for clients
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_instance_id_sharding() {
        let id1 = InstanceId::new("svc-1");
        let id2 = InstanceId::new("svc-2");
        let id3 = InstanceId::new("svc-1");

        assert_eq!(id1.shard_index(), id3.shard_index());
        assert!(id1.shard_index() < REGISTRY_SHARD_COUNT);
        assert!(id2.shard_index() < REGISTRY_SHARD_COUNT);
    }

    #[test]
    fn test_registration_validation() {
        assert!(InstanceRegistration::new("svc-1", "orders", "10.0.0.1", 8080)
            .validate()
            .is_ok());
        assert!(InstanceRegistration::new("", "orders", "10.0.0.1", 8080)
            .validate()
            .is_err());
        assert!(InstanceRegistration::new("svc-1", " ", "10.0.0.1", 8080)
            .validate()
            .is_err());
        assert!(InstanceRegistration::new("svc-1", "orders", "10.0.0.1", 0)
            .validate()
            .is_err());
        assert!(InstanceRegistration::new("a/b", "orders", "10.0.0.1", 80)
            .validate()
            .is_err());
    }

    #[test]
    fn test_renew_promotes_starting_and_skips_down() {
        let t0 = Utc::now();
        let mut instance = ServiceInstance::from_registration(
            InstanceRegistration::new("svc-1", "orders", "10.0.0.1", 8080),
            t0,
        );
        assert_eq!(instance.status, InstanceStatus::Starting);

        let t1 = t0 + Duration::seconds(10);
        assert!(instance.renew(t1));
        assert_eq!(instance.status, InstanceStatus::Up);
        assert_eq!(instance.last_renewal, t1);

        instance.status = InstanceStatus::Down;
        assert!(!instance.renew(t1 + Duration::seconds(10)));
        assert_eq!(instance.last_renewal, t1);
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("out_of_service".parse::<InstanceStatus>().unwrap(), InstanceStatus::OutOfService);
        assert!("sleeping".parse::<InstanceStatus>().is_err());
        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");
    }

    #[test]
    fn test_lease_expiry_is_strict() {
        let t0 = Utc::now();
        let instance = ServiceInstance::from_registration(
            InstanceRegistration::new("svc-1", "orders", "h", 1),
            t0,
        );
        let lease = Duration::seconds(90);
        assert!(!instance.is_expired(t0 + Duration::seconds(90), lease));
        assert!(instance.is_expired(t0 + Duration::seconds(91), lease));
    }
}
