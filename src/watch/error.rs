//! Watch error types.

/// Errors raised while acquiring the resource chain for a new watch.
///
/// Always reported synchronously to the subscriber that triggered acquisition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The connection id is not known to the storage backend.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The remote endpoint could not be reached or rejected the session.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The directory does not exist or is not a directory.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// The directory exists but cannot be watched with the configured credentials.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The registry has been shut down.
    #[error("Watch registry is shutting down")]
    ShuttingDown,
}

/// Failures reported by a live watch resource.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// Recoverable; the worker reconnects with backoff.
    #[error("Transient watch failure: {0}")]
    Transient(String),

    /// Unrecoverable; the entry goes to Errored.
    #[error("Permanent watch failure: {0}")]
    Permanent(String),

    /// The resource was closed underneath the blocked wait.
    #[error("Watch cancelled")]
    Cancelled,
}

impl WatchError {
    /// Whether the worker should retry after this failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<AcquisitionError> for WatchError {
    /// Classifies a failed reconnect. Network failures stay transient;
    /// a vanished directory or revoked access does not heal by retrying.
    fn from(err: AcquisitionError) -> Self {
        match err {
            AcquisitionError::ConnectionFailed(_) => Self::Transient(err.to_string()),
            AcquisitionError::ShuttingDown => Self::Cancelled,
            _ => Self::Permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_error_display() {
        let err = AcquisitionError::PathNotFound("photos/2024".to_string());
        assert_eq!(err.to_string(), "Path not found: photos/2024");

        let err = AcquisitionError::ShuttingDown;
        assert_eq!(err.to_string(), "Watch registry is shutting down");
    }

    #[test]
    fn test_watch_error_classification() {
        assert!(WatchError::Transient("socket closed".into()).is_transient());
        assert!(!WatchError::Permanent("auth rejected".into()).is_transient());
        assert!(!WatchError::Cancelled.is_transient());
    }

    #[test]
    fn test_reconnect_failure_classification() {
        let err: WatchError = AcquisitionError::ConnectionFailed("timed out".into()).into();
        assert!(err.is_transient());

        let err: WatchError = AcquisitionError::PermissionDenied("docs".into()).into();
        assert!(matches!(err, WatchError::Permanent(_)));

        let err: WatchError = AcquisitionError::PathNotFound("docs".into()).into();
        assert!(matches!(err, WatchError::Permanent(_)));

        let err: WatchError = AcquisitionError::ShuttingDown.into();
        assert_eq!(err, WatchError::Cancelled);
    }
}
