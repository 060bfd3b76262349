//! Outbound delivery seam between the hub and client connections.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::message::ServerMessage;

/// Best-effort delivery of server messages to one session.
///
/// Implementations must not block and must never fail into the caller;
/// watch workers call `send` directly.
pub trait Transport: Send + Sync {
    fn send(&self, session_id: &str, message: ServerMessage);
}

/// Transport backed by one unbounded queue per session.
///
/// The WebSocket task registers a session, drains the receiver into the
/// socket, and unregisters on close.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbound queue for a session.
    pub fn register(&self, session_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(session_id.to_string(), tx);
        rx
    }

    /// Drop the outbound queue for a session.
    pub fn unregister(&self, session_id: &str) {
        self.senders.write().remove(session_id);
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for ChannelTransport {
    fn send(&self, session_id: &str, message: ServerMessage) {
        let senders = self.senders.read();
        let Some(tx) = senders.get(session_id) else {
            tracing::debug!(session = session_id, "Dropping message for unknown session");
            return;
        };
        if tx.send(message).is_err() {
            tracing::debug!(session = session_id, "Session queue closed, message dropped");
        }
    }
}
