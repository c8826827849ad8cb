//! Error types for the sync engine.

use crate::remote::RemoteError;
use crate::sync_error::TableOperationError;
use thiserror::Error;

/// Why a push batch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// The batch walked every operation; per-operation errors, if any,
    /// were recorded as error rows.
    Complete,
    /// Aborted on a network failure.
    CancelledByNetworkError,
    /// Aborted on an authentication failure.
    CancelledByAuthenticationError,
    /// Aborted because an operation requested it.
    CancelledByOperation,
    /// Aborted because the external cancellation token fired.
    CancelledByToken,
    /// Aborted because the local store failed mid-batch.
    CancelledBySyncStoreError,
    /// Aborted on an unclassified internal failure.
    InternalError,
}

impl PushStatus {
    /// True when the batch ran to completion.
    pub fn is_complete(self) -> bool {
        matches!(self, PushStatus::Complete)
    }
}

/// A failure propagated from the local store.
///
/// Store backends are consumed through [`crate::LocalStore`]; whatever
/// they raise is wrapped here so the engine surfaces one store error
/// shape.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    /// Creates a store error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a store error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// All possible errors from the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Validation failure: forbidden query shape, reserved parameter,
    /// bad or missing id.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested change cannot be reconciled with queued state,
    /// or a conflict resolution raced a newer operation.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// The local store failed; wraps the cause.
    #[error("local store failure: {0}")]
    LocalStore(#[from] StoreError),

    /// The remote table failed; carries HTTP status and body.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A push batch did not fully succeed.
    #[error("push failed with status {status:?} and {} unhandled error(s)", .errors.len())]
    PushFailed {
        /// Why the batch stopped.
        status: PushStatus,
        /// Error rows the completion handler did not mark handled.
        errors: Vec<TableOperationError>,
        /// The abort-triggering failure, when one exists.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A conflicted property holds an object or array value.
    #[error("property '{0}' has a non-primitive value and cannot be merged")]
    UnsupportedConflictValue(String),

    /// A resolution primitive was invoked twice for the same conflict.
    #[error("conflict for property '{0}' has already been handled")]
    AlreadyHandled(String),

    /// The operation was cancelled by its token.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for [`Error::InvalidInput`].
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    /// Shorthand for [`Error::InconsistentState`].
    pub fn inconsistent_state(message: impl Into<String>) -> Self {
        Error::InconsistentState(message.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::new("table missing");
        assert_eq!(err.to_string(), "table missing");

        let err: Error = StoreError::new("disk full").into();
        assert_eq!(err.to_string(), "local store failure: disk full");
    }

    #[test]
    fn store_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = StoreError::with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn push_failed_display() {
        let err = Error::PushFailed {
            status: PushStatus::Complete,
            errors: Vec::new(),
            source: None,
        };
        assert!(err.to_string().contains("Complete"));
        assert!(err.to_string().contains("0 unhandled"));
    }

    #[test]
    fn status_completion() {
        assert!(PushStatus::Complete.is_complete());
        assert!(!PushStatus::CancelledByToken.is_complete());
    }
}
