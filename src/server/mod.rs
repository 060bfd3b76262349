//! HTTP and WebSocket surface.

mod error;
mod handlers;
mod service;
mod socket;

pub use error::ServerError;
pub use handlers::{AppState, HealthResponse};
pub use service::WatchServer;
