//! Session subscriptions and change fan-out.
//!
//! Each session holds at most one registry subscription per key. The slot for
//! a key in the session's table is the single token for releasing that
//! subscription: whoever removes the slot under the hub lock performs the
//! registry unsubscribe, so close, explicit unsubscribe and watch loss can
//! interleave freely without releasing twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::error::HubError;
use super::message::{ClientMessage, ServerMessage};
use super::transport::Transport;
use crate::watch::{
    ChangeEvent, SubscriptionHandle, WatchKey, WatchListener, WatchSubscriptions,
};

enum Slot {
    /// Registry subscribe in flight, tagged with its attempt id.
    Pending(u64),
    Active(SubscriptionHandle),
}

#[derive(Default)]
struct SessionRecord {
    subscriptions: HashMap<WatchKey, Slot>,
}

struct HubInner {
    registry: Arc<dyn WatchSubscriptions>,
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    next_attempt: AtomicU64,
}

impl HubInner {
    fn is_subscribed(&self, session_id: &str, key: &WatchKey) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|record| record.subscriptions.contains_key(key))
    }

    /// Remove the slot for `key` and release it if it was active.
    fn release(&self, session_id: &str, key: &WatchKey) -> bool {
        let slot = self
            .sessions
            .lock()
            .get_mut(session_id)
            .and_then(|record| record.subscriptions.remove(key));

        match slot {
            Some(Slot::Active(handle)) => {
                self.registry.unsubscribe(&handle);
                true
            }
            // The in-flight subscribe sees the slot gone and releases itself.
            Some(Slot::Pending(_)) => true,
            None => false,
        }
    }
}

/// Outcome of a successful [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
}

/// Tracks which sessions want which keys and pushes changes to them.
#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
    case_insensitive: bool,
}

impl NotificationHub {
    /// Create a hub over `registry`, delivering through `transport`.
    #[must_use]
    pub fn new(registry: Arc<dyn WatchSubscriptions>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry,
                transport,
                sessions: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(0),
            }),
            case_insensitive: true,
        }
    }

    /// Set whether client paths are matched case-insensitively. The returned
    /// handle shares sessions with every other clone of this hub.
    #[must_use]
    pub fn with_case_insensitive(mut self, case_insensitive: bool) -> Self {
        self.case_insensitive = case_insensitive;
        self
    }

    /// Build the key a client's `(connectionId, path)` addresses.
    #[must_use]
    pub fn key_for(&self, connection_id: &str, path: &str) -> WatchKey {
        WatchKey::with_case(connection_id, path, self.case_insensitive)
    }

    /// Register a newly connected session. Returns false if it already exists.
    pub fn open_session(&self, session_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(session_id.to_string(), SessionRecord::default());
        drop(sessions);
        tracing::info!(session = session_id, "Session opened");
        true
    }

    /// Subscribe a session to `key`. Idempotent per session and key.
    ///
    /// `display_path` is echoed back in notifications so clients see the path
    /// they asked for rather than its normalised form.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownSession`] for unopened sessions,
    /// [`HubError::SessionClosed`] if the session closed mid-flight, or the
    /// registry's acquisition error.
    pub fn subscribe(
        &self,
        session_id: &str,
        key: &WatchKey,
        display_path: &str,
    ) -> Result<SubscribeOutcome, HubError> {
        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.inner.sessions.lock();
            let record = sessions
                .get_mut(session_id)
                .ok_or_else(|| HubError::UnknownSession(session_id.to_string()))?;
            if record.subscriptions.contains_key(key) {
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            record
                .subscriptions
                .insert(key.clone(), Slot::Pending(attempt));
        }

        let listener = Arc::new(SessionListener {
            hub: Arc::downgrade(&self.inner),
            session_id: session_id.to_string(),
            connection_id: key.connection_id().to_string(),
            display_path: display_path.to_string(),
        });

        let result = self.inner.registry.subscribe(key, listener);

        let mut sessions = self.inner.sessions.lock();
        // Still ours unless an unsubscribe or close took the slot meanwhile.
        let record = sessions
            .get_mut(session_id)
            .filter(|r| matches!(r.subscriptions.get(key), Some(Slot::Pending(id)) if *id == attempt));

        match (result, record) {
            (Ok(handle), Some(record)) => {
                record.subscriptions.insert(key.clone(), Slot::Active(handle));
                drop(sessions);
                tracing::info!(session = session_id, key = %key, "Session subscribed");
                Ok(SubscribeOutcome::Subscribed)
            }
            (Ok(handle), None) => {
                drop(sessions);
                self.inner.registry.unsubscribe(&handle);
                tracing::debug!(session = session_id, key = %key, "Session went away during subscribe");
                Err(HubError::SessionClosed(session_id.to_string()))
            }
            (Err(err), record) => {
                if let Some(record) = record {
                    record.subscriptions.remove(key);
                }
                Err(err.into())
            }
        }
    }

    /// Unsubscribe a session from `key`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, session_id: &str, key: &WatchKey) -> bool {
        let released = self.inner.release(session_id, key);
        if released {
            tracing::info!(session = session_id, key = %key, "Session unsubscribed");
        }
        released
    }

    /// Drop a session and release each of its subscriptions exactly once.
    pub fn close_session(&self, session_id: &str) {
        let Some(record) = self.inner.sessions.lock().remove(session_id) else {
            return;
        };

        let mut released = 0usize;
        for slot in record.subscriptions.into_values() {
            if let Slot::Active(handle) = slot {
                self.inner.registry.unsubscribe(&handle);
                released += 1;
            }
        }
        tracing::info!(session = session_id, released, "Session closed");
    }

    /// Handle one client frame and reply through the transport.
    ///
    /// Blocks while a first subscriber acquires the watch resource.
    pub fn handle_message(&self, session_id: &str, message: ClientMessage) {
        let reply = match message {
            ClientMessage::Subscribe {
                connection_id,
                path,
            } => {
                let key = self.key_for(&connection_id, &path);
                match self.subscribe(session_id, &key, &path) {
                    Ok(_) => ServerMessage::Subscribed {
                        connection_id,
                        path,
                    },
                    Err(HubError::UnknownSession(_) | HubError::SessionClosed(_)) => return,
                    Err(err) => {
                        tracing::warn!(session = session_id, key = %key, error = %err, "Subscribe failed");
                        ServerMessage::Error {
                            connection_id: Some(connection_id),
                            path: Some(path),
                            message: err.to_string(),
                        }
                    }
                }
            }
            ClientMessage::Unsubscribe {
                connection_id,
                path,
            } => {
                let key = self.key_for(&connection_id, &path);
                self.unsubscribe(session_id, &key);
                ServerMessage::Unsubscribed {
                    connection_id,
                    path,
                }
            }
            ClientMessage::Ping => ServerMessage::Pong,
        };
        self.inner.transport.send(session_id, reply);
    }

    /// Keys a session is currently subscribed to, sorted.
    #[must_use]
    pub fn subscriptions(&self, session_id: &str) -> Vec<WatchKey> {
        let mut keys: Vec<_> = self
            .inner
            .sessions
            .lock()
            .get(session_id)
            .map(|record| record.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}

/// Registry listener for one (session, key) subscription.
///
/// Fan-out for a key is the registry invoking every subscribed session's
/// listener in turn; each delivery is an independent, non-blocking send.
struct SessionListener {
    hub: Weak<HubInner>,
    session_id: String,
    connection_id: String,
    display_path: String,
}

impl WatchListener for SessionListener {
    fn on_change(&self, event: &ChangeEvent) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if !hub.is_subscribed(&self.session_id, &event.key) {
            return;
        }
        hub.transport.send(
            &self.session_id,
            ServerMessage::DirectoryChanged {
                connection_id: self.connection_id.clone(),
                path: self.display_path.clone(),
                change: event.change_type,
                name: event.name.clone(),
                sequence: event.sequence,
            },
        );
    }

    fn on_lost(&self, key: &WatchKey, reason: &str) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        // Release the handle so a later subscribe from this session starts fresh.
        if !hub.release(&self.session_id, key) {
            return;
        }
        hub.transport.send(
            &self.session_id,
            ServerMessage::MonitoringLost {
                connection_id: self.connection_id.clone(),
                path: self.display_path.clone(),
                reason: reason.to_string(),
            },
        );
    }
}
