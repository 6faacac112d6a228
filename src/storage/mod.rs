//! Storage backends for telemetry persistence
//!
//! ## Design
//!
//! - **Trait-based**: `TelemetryStore` allows swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Atomic per sample**: multi-row samples are all-or-nothing
//!
//! ## Backends
//!
//! - **SQLite** (default, `storage-sqlite` feature): one table per kind
//! - **In-Memory**: No persistence, for tests or `"backend": "none"`
//!
//! ## Usage
//!
//! ```no_run
//! use hostscope::storage::{TelemetryStore, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./telemetry.db").await?;
//!     println!("{}", backend.stats().await?);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::StorageConfig;

pub mod backend;
pub mod error;
pub mod export;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{ExportFormat, HealthStatus, PruneReport, QueryFilter, TelemetryStore};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::MetricRow;

/// Open the backend selected by `config`.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn TelemetryStore>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory storage (no persistence)");
            Ok(Arc::new(MemoryBackend::new()))
        }

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}
