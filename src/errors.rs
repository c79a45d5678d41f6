//! Typed errors for the control-plane components.
//!
//! `StorageError` is the programmatic error type callers pattern-match on
//! for the durable event store; everywhere else `anyhow::Error` wraps the
//! underlying cause at task and `main` boundaries where only human-readable
//! context matters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("event store not initialized")]
    NotInitialized,
}
