//! Control Plane Module
//!
//! Wires the registry, replication and configuration components into one
//! node and exposes it over HTTP.

pub mod api;
pub mod node;

pub use api::*;
pub use node::*;
