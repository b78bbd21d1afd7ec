//! Storage backends for targets, check history and incidents
//!
//! ## Design
//!
//! - **Trait-based**: one small trait per collaborator (`TargetStore`,
//!   `StateStore`, `EventStore`, `MaintenanceStore`, `ChannelStore`,
//!   `IncidentStore`), so tests can replace a single store
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Atomic commits**: `StateStore::commit_check` writes a check's events
//!   and its new target state in one step
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database
//! - **In-Memory**: No persistence, for testing or `storage.backend = "none"`
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use guardia_watch::storage::{Stores, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SqliteBackend::new("./guardia.db").await?);
//!     let stores = Stores::from_backend(backend);
//!     // Hand the stores to the engine
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{
    ChannelStore, EventStore, HealthStatus, IncidentStore, MaintenanceStore, StateStore,
    StorageBackend, TargetStore,
};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;

/// The set of stores the engine and its helpers work against
#[derive(Clone)]
pub struct Stores {
    pub targets: Arc<dyn TargetStore>,
    pub states: Arc<dyn StateStore>,
    pub events: Arc<dyn EventStore>,
    pub maintenance: Arc<dyn MaintenanceStore>,
    pub channels: Arc<dyn ChannelStore>,
    pub incidents: Arc<dyn IncidentStore>,
}

impl Stores {
    /// Serve every store from one backend
    pub fn from_backend<B: StorageBackend + 'static>(backend: Arc<B>) -> Self {
        Self {
            targets: backend.clone(),
            states: backend.clone(),
            events: backend.clone(),
            maintenance: backend.clone(),
            channels: backend.clone(),
            incidents: backend,
        }
    }
}
