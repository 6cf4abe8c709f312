//! Service Registry Module
//!
//! Sharded in-memory instance table, lease tracking and eviction. The
//! registry is not durable: after a restart it is rebuilt from
//! re-registrations and peer replication.

pub mod events;
pub mod heartbeat;
pub mod instance;
pub mod store;

pub use events::*;
pub use heartbeat::*;
pub use instance::*;
pub use store::*;
