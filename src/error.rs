//! Error types shared by the repository, the aggregate model and the bus.

use std::io;

/// Result type for event-source operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers.
///
/// A missing aggregate is not an error: [`Repository::load`](crate::Repository::load)
/// returns `Ok(None)`. Handler failures are reported as
/// [`DispatchError`](crate::DispatchError) and never propagate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure while creating, reading, writing or replacing a file
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `new_instance` found existing files for the id
    #[error("Aggregate already exists: {0}")]
    AlreadyExists(String),

    /// On-disk state violates the snapshot/log invariants
    #[error("Corrupted data for aggregate {id}: {reason}")]
    Corrupted { id: String, reason: String },

    /// The background writer failed for this entity and refuses further appends
    #[error("Event log writer failed for aggregate {id}: {reason}")]
    WriterFailed { id: String, reason: String },

    /// The repository has been closed
    #[error("Repository is closed")]
    Closed,

    /// The event bus has been closed
    #[error("Event bus is closed")]
    BusClosed,

    /// Bus workers did not drain within the shutdown timeout
    #[error("Event bus shutdown timed out with {pending} subscriber(s) still running")]
    ShutdownTimeout { pending: usize },
}

impl Error {
    pub(crate) fn corrupted(id: &str, reason: impl Into<String>) -> Self {
        Error::Corrupted {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error came from the file system
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
