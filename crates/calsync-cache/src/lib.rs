//! calsync Cache - Sync state persistence
//!
//! Storage for:
//! - Source, destination and global configuration
//! - Per-calendar sync tokens and `last_sync` timestamps
//! - Registered relay agents and their inbox of pushed batches
//! - The dedup index
//!
//! ## Architecture
//!
//! This crate implements the `ISyncStateStore` port from `calsync-core`
//! twice: [`SqliteStateStore`] is the durable adapter used by the daemon and
//! [`MemoryStateStore`] keeps everything in process for tests and
//! embedders that bring their own persistence.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteStateStore`] - SQLite `ISyncStateStore`
//! - [`MemoryStateStore`] - In-process `ISyncStateStore`
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use calsync_cache::{DatabasePool, SqliteStateStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/calsync/calsync.db")).await?;
//! let store = SqliteStateStore::new(pool.pool().clone());
//! // Use store as ISyncStateStore...
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod pool;
pub mod repository;

pub use memory::MemoryStateStore;
pub use pool::DatabasePool;
pub use repository::SqliteStateStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be turned back into a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A write referenced a source that is not configured
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// A write referenced an agent that is not registered
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// A relay batch was appended out of sequence
    #[error("Relay batch for {source_id} out of sequence: expected {expected}, got {got}")]
    RelaySequence {
        source_id: String,
        expected: u64,
        got: u64,
    },
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
