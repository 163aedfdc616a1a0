use thiserror::Error;

use crate::types::MessageId;

/// Failures reported by an external collaborator (feed, record store,
/// content store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("No record at {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Backend connection closed")]
    Closed,
}

/// Errors produced by the sync core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed or missing fields in a feed payload or a local request.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A resolution for this message is already in flight.
    #[error("Attachment resolution already pending for message {0}")]
    AlreadyPending(MessageId),

    /// A write or fetch was rejected by the backend.
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] BackendError),

    /// An update referenced an id that is not known locally.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyncError>;
