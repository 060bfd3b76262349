//! Server error types.

/// Errors that can occur while running the HTTP/WebSocket server.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind to {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Serving failed after the listener was bound.
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
