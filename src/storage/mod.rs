//! Storage backends for ping results, alert state and targets
//!
//! This module provides a trait-based abstraction over the persistence
//! boundary of the engine.
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database, feature `storage-sqlite`
//! - **In-Memory** (fallback): No persistence, for testing or event-only deployments
//!
//! ## Usage
//!
//! ```no_run
//! use ping_monitoring::config::StorageConfig;
//! use ping_monitoring::storage::open_storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = open_storage(Some(&StorageConfig::default())).await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::PingStatistics;

use crate::config::StorageConfig;

/// Open the backend described by the configuration (in-memory when absent)
pub async fn open_storage(config: Option<&StorageConfig>) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        None | Some(StorageConfig::None) => {
            info!("using in-memory storage, ping results will not survive a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path, .. }) => {
            Ok(Arc::new(sqlite::SqliteBackend::new(path).await?))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => Err(StorageError::InvalidConfig(
            "sqlite storage requested but the storage-sqlite feature is disabled".to_string(),
        )),
    }
}
