//! Error types for chunkwarden-core

use thiserror::Error;

/// Main error type for the chunkwarden-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence failure in the resilience store
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The chunk universe could not be enumerated
    #[error("detection error: {0}")]
    Detection(String),

    /// A migration strategy handler failed
    #[error("migration {migration_id} failed: {message}")]
    MigrationExecution {
        migration_id: String,
        message: String,
    },

    /// A single orphan could not be reclaimed
    #[error("cleanup of chunk {chunk_id} failed: {message}")]
    Cleanup { chunk_id: String, message: String },

    /// Chunk status change not allowed by the lifecycle
    #[error("invalid status transition for chunk {chunk_id}: {from} -> {to}")]
    InvalidTransition {
        chunk_id: String,
        from: String,
        to: String,
    },

    /// Migration plan not found
    #[error("migration plan not found: {0}")]
    PlanNotFound(String),
}

/// Result type alias for chunkwarden-core
pub type Result<T> = std::result::Result<T, Error>;
