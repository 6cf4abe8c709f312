//! Registry Events
//!
//! Events emitted by the registry store for replication and for external
//! consumers reacting to instance lifecycle changes.

use super::instance::{InstanceStatus, ServiceInstance};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of state change an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryEventKind {
    /// Instance registered (or re-registered)
    Register,
    /// Lease renewed
    Renew,
    /// Instance deregistered itself
    Cancel,
    /// Lease expired and the monitor removed the instance
    Evict,
    /// Status override
    Status,
}

impl RegistryEventKind {
    /// Whether the event removes the instance
    pub fn is_removal(&self) -> bool {
        matches!(self, RegistryEventKind::Cancel | RegistryEventKind::Evict)
    }
}

impl std::fmt::Display for RegistryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEventKind::Register => write!(f, "REGISTER"),
            RegistryEventKind::Renew => write!(f, "RENEW"),
            RegistryEventKind::Cancel => write!(f, "CANCEL"),
            RegistryEventKind::Evict => write!(f, "EVICT"),
            RegistryEventKind::Status => write!(f, "STATUS"),
        }
    }
}

/// Where an event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Produced by an operation on this node
    #[default]
    Local,
    /// Applied from a peer's replication push
    Peer,
}

/// Immutable record of one registry state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub instance_id: String,
    pub app_name: String,
    pub timestamp: DateTime<Utc>,
    /// Instance state after the change; absent for removals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ServiceInstance>,
    #[serde(default)]
    pub origin: EventOrigin,
}

impl RegistryEvent {
    /// Event carrying the post-change instance state
    pub fn upsert(kind: RegistryEventKind, instance: &ServiceInstance, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            instance_id: instance.instance_id.to_string(),
            app_name: instance.app_name.clone(),
            timestamp,
            instance: Some(instance.clone()),
            origin: EventOrigin::Local,
        }
    }

    /// Cancel or evict event
    pub fn removal(kind: RegistryEventKind, instance: &ServiceInstance, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            instance_id: instance.instance_id.to_string(),
            app_name: instance.app_name.clone(),
            timestamp,
            instance: None,
            origin: EventOrigin::Local,
        }
    }

    /// Mark as received from a peer
    pub fn from_peer(mut self) -> Self {
        self.origin = EventOrigin::Peer;
        self
    }

    /// Whether this event should be pushed to peers
    #[inline]
    pub fn is_replicable(&self) -> bool {
        self.origin == EventOrigin::Local
    }

    /// Status carried by the event, if any
    pub fn status(&self) -> Option<InstanceStatus> {
        self.instance.as_ref().map(|i| i.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::instance::InstanceRegistration;

    fn instance() -> ServiceInstance {
        ServiceInstance::from_registration(
            InstanceRegistration::new("svc-1", "orders", "10.0.0.1", 8080),
            Utc::now(),
        )
    }

    #[test]
    fn test_upsert_and_removal_events() {
        let inst = instance();
        let register = RegistryEvent::upsert(RegistryEventKind::Register, &inst, inst.registered_at);
        assert_eq!(register.instance_id, "svc-1");
        assert_eq!(register.status(), Some(InstanceStatus::Starting));
        assert!(register.is_replicable());
        assert!(!register.kind.is_removal());

        let cancel = RegistryEvent::removal(RegistryEventKind::Cancel, &inst, Utc::now());
        assert!(cancel.instance.is_none());
        assert!(cancel.kind.is_removal());
    }

    #[test]
    fn test_peer_events_are_not_replicable() {
        let inst = instance();
        let event = RegistryEvent::upsert(RegistryEventKind::Renew, &inst, Utc::now()).from_peer();
        assert!(!event.is_replicable());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "RENEW");
        assert_eq!(json["origin"], "peer");
    }
}
