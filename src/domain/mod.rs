//! Domain layer - Port definitions and shared primitives
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, plus the clock abstraction
//! lease arithmetic runs on.

pub mod clock;
pub mod ports;

pub use clock::*;
pub use ports::*;
