//! Sharewatch - shared directory change watching with per-session fan-out.
//!
//! Many clients watching the same remote directory share one underlying
//! change watch. The [`watch`] module owns those shared watches, the [`hub`]
//! module maps client sessions onto them, and [`server`] exposes the push
//! channel over WebSocket.

pub mod config;
pub mod hub;
pub mod server;
/// Scripted doubles shared by unit and integration tests. Not part of the API.
#[doc(hidden)]
pub mod testing;
pub mod watch;
