//! Error types for the worker.

use std::path::PathBuf;

use thiserror::Error;
use tierlink_core::{StatusError, TransportError};
use tierlink_proto::BlockId;

use crate::config::ConfigError;

/// Errors surfaced by worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Could not reach the coordinator.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A call to the coordinator failed.
    #[error(transparent)]
    Rpc(#[from] StatusError),

    /// Local block storage failed.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The block is not stored on this worker.
    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    /// The block is already stored on this worker.
    #[error("block {0} already exists")]
    BlockExists(BlockId),

    /// The block is still being written.
    #[error("block {0} is being written")]
    BlockBusy(BlockId),

    /// No directory accepted the block.
    #[error("no storage directory accepted block {block_id} ({length} bytes)")]
    NoSpace { block_id: BlockId, length: u64 },

    /// The coordinator revoked the session or the connection dropped.
    #[error("coordinator session lost")]
    SessionLost,
}

impl WorkerError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
