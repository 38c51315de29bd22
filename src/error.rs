//! Error types for the world-state engine.

use crate::field::Fr;
use crate::types::TreeId;
use thiserror::Error;

/// Failures raised by the persistent key-value layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record in {table}: {reason}")]
    Corrupt { table: String, reason: String },
}

impl StoreError {
    /// Wraps an arbitrary backend failure, keeping only its message.
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        StoreError::Backend(err.to_string())
    }

    pub(crate) fn corrupt(table: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Failures raised by tree operations and the engine.
///
/// Read misses are not errors: lookups for absent leaves return `None`.
#[derive(Debug, Error)]
pub enum WorldStateError {
    /// An indexed tree that forbids duplicates was asked to insert a key it
    /// already holds.
    #[error("duplicate key {0} in indexed tree")]
    DuplicateKey(Fr),

    /// An append would push the leaf count past `2^depth`.
    #[error("tree is full: {size} + {appended} leaves exceeds capacity of depth-{depth} tree")]
    TreeFull { size: u64, appended: u64, depth: u32 },

    /// A historical block selector was used but no block index is persisted.
    #[error("invalid revision: historical block {0} is not available")]
    InvalidRevision(u32),

    /// `sync_block` produced a state that differs from the block's expected
    /// state reference.
    #[error("block state mismatch on tree {0:?}")]
    BlockStateMismatch(TreeId),

    /// The requested operation does not exist for this tree kind, e.g.
    /// appending raw field elements to an indexed tree.
    #[error("operation not supported by tree {0:?}")]
    InvalidTreeOperation(TreeId),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The dispatcher has no handler for this message type.
    #[error("unknown message type {0}")]
    UnknownMessage(u32),

    /// The worker pool shut down before the operation could complete.
    #[error("worker pool shut down")]
    Shutdown,
}
