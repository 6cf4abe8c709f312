//! API Module
//!
//! REST surface of the node: registry, peer replication, configuration and
//! change delivery.

pub mod config;
pub mod rest;
pub mod server;

pub use config::*;
pub use rest::*;
pub use server::*;
