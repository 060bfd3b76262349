//! Hub error types.

use crate::watch::AcquisitionError;

/// Errors returned by [`NotificationHub`](super::NotificationHub) operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// No session with this id was opened.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// The session closed while the operation was in flight.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// The watch could not be started.
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}
