//! Snapshot Storage Backends
//!
//! Durable homes for configuration history. The snapshot store writes
//! through a backend before a version becomes visible.

mod file;
mod memory;

pub use file::{FileBackend, FileBackendConfig};
pub use memory::MemoryBackend;

use crate::domain::ports::SnapshotBackend;
use std::sync::Arc;

/// Shared backend handle
pub type SharedBackend = Arc<dyn SnapshotBackend>;
