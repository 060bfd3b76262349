//! Process-wide table of shared watches.
//!
//! All cross-thread mutable state (the key → entry map and each entry's
//! refcount, state and listener set) sits behind one lock. Critical sections
//! are short and never span backend I/O: acquisition, cancellation, joins and
//! resource release all happen with the lock released.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::backend::{WatchBackend, WatchListener, WatchResource};
use super::entry::{spawn_worker, EntrySnapshot, WatchEntry, WatchState, WorkerHandle};
use super::error::AcquisitionError;
use super::key::WatchKey;
use super::retry::RetryPolicy;
use crate::config::WatchConfig;

pub(crate) struct Tables {
    pub(crate) entries: HashMap<WatchKey, WatchEntry>,
    next_id: u64,
    closed: bool,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// State shared between the registry and its workers.
pub(crate) struct RegistryShared {
    pub(crate) tables: Mutex<Tables>,
    /// Signalled on every state change waiters may care about.
    pub(crate) changed: Condvar,
    pub(crate) backend: Arc<dyn WatchBackend>,
    pub(crate) policy: RetryPolicy,
    teardown_timeout: Duration,
    shutdown_timeout: Duration,
}

impl RegistryShared {
    fn remove_entry(&self, key: &WatchKey, entry_id: u64) {
        let mut tables = self.tables.lock();
        if tables.entries.get(key).is_some_and(|e| e.id == entry_id) {
            tables.entries.remove(key);
            tracing::info!(key = %key, "Watch removed");
        }
        drop(tables);
        self.changed.notify_all();
    }

    /// Drop a stopping entry whose worker outlived its teardown, once that
    /// worker has finally released the resource.
    pub(crate) fn remove_abandoned(&self, key: &WatchKey, entry_id: u64, generation: u64) {
        let mut tables = self.tables.lock();
        let stale = tables.entries.get(key).is_some_and(|e| {
            e.id == entry_id && e.generation == generation && e.state == WatchState::Stopping
        });
        if stale {
            tables.entries.remove(key);
            tracing::info!(key = %key, "Watch removed after late worker exit");
        }
        drop(tables);
        self.changed.notify_all();
    }

    /// Join the worker and drop the entry. If the worker is wedged the entry
    /// stays `Stopping` until the worker exits on its own.
    fn finish_teardown(
        &self,
        key: &WatchKey,
        entry_id: u64,
        worker: Option<WorkerHandle>,
    ) -> bool {
        let clean = worker.map_or(true, |w| w.finish(key, self.teardown_timeout));
        if clean {
            self.remove_entry(key, entry_id);
        }
        clean
    }
}

/// Proof of one subscription. Pass it back to [`WatchRegistry::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: WatchKey,
    entry_id: u64,
    id: u64,
}

impl SubscriptionHandle {
    /// Key this subscription is attached to.
    #[must_use]
    pub fn key(&self) -> &WatchKey {
        &self.key
    }
}

/// Outcome of [`WatchRegistry::unsubscribe`].
#[derive(Debug)]
pub enum Unsubscribed {
    /// The handle was stale or already released.
    NotSubscribed,
    /// Other subscribers remain; the resource stays open.
    Released { remaining: usize },
    /// This was the last subscriber; teardown runs in the background.
    Stopping(Teardown),
}

/// Completion signal for a background teardown.
#[derive(Debug)]
pub struct Teardown {
    done: std_mpsc::Receiver<()>,
}

impl Teardown {
    /// Block until the entry is fully removed. Returns false on timeout, or
    /// if the worker missed the teardown deadline and release was deferred
    /// to its own exit.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        self.done.recv_timeout(timeout).is_ok()
    }
}

/// Result of [`WatchRegistry::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entries whose worker exited and whose resources were released.
    pub stopped: usize,
    /// Entries abandoned because the deadline passed.
    pub abandoned: usize,
}

/// The subscribe/unsubscribe capability consumers depend on.
///
/// [`WatchRegistry`] is the production implementation; tests wrap it to
/// observe calls.
pub trait WatchSubscriptions: Send + Sync {
    /// See [`WatchRegistry::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns an [`AcquisitionError`] if acquisition was attempted and failed.
    fn subscribe(
        &self,
        key: &WatchKey,
        listener: Arc<dyn WatchListener>,
    ) -> Result<SubscriptionHandle, AcquisitionError>;

    /// See [`WatchRegistry::unsubscribe`].
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Unsubscribed;
}

impl WatchSubscriptions for WatchRegistry {
    fn subscribe(
        &self,
        key: &WatchKey,
        listener: Arc<dyn WatchListener>,
    ) -> Result<SubscriptionHandle, AcquisitionError> {
        WatchRegistry::subscribe(self, key, listener)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Unsubscribed {
        WatchRegistry::unsubscribe(self, handle)
    }
}

/// Refcounted registry of shared watches, keyed by [`WatchKey`].
///
/// Construct one per process and pass it (cheaply cloned) to every caller.
#[derive(Clone)]
pub struct WatchRegistry {
    shared: Arc<RegistryShared>,
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("entries", &self.len())
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

impl WatchRegistry {
    /// Create a registry over `backend` with retry and timeout settings from `config`.
    #[must_use]
    pub fn new(backend: Arc<dyn WatchBackend>, config: &WatchConfig) -> Self {
        Self::with_policy(
            backend,
            RetryPolicy::from(config),
            Duration::from_millis(config.teardown_timeout_ms),
            Duration::from_millis(config.shutdown_timeout_ms),
        )
    }

    /// Create a registry with an explicit retry policy and timeouts.
    #[must_use]
    pub fn with_policy(
        backend: Arc<dyn WatchBackend>,
        policy: RetryPolicy,
        teardown_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                tables: Mutex::new(Tables {
                    entries: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
                changed: Condvar::new(),
                backend,
                policy,
                teardown_timeout,
                shutdown_timeout,
            }),
        }
    }

    /// Subscribe `listener` to changes under `key`.
    ///
    /// The first subscriber acquires the resource synchronously, on the
    /// calling thread, and starts the worker. Later subscribers only attach.
    /// A subscriber arriving while the entry is starting or stopping waits
    /// for that transition to finish.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`AcquisitionError`] if this call had to acquire
    /// and failed, or [`AcquisitionError::ShuttingDown`] after shutdown.
    pub fn subscribe(
        &self,
        key: &WatchKey,
        listener: Arc<dyn WatchListener>,
    ) -> Result<SubscriptionHandle, AcquisitionError> {
        let mut tables = self.shared.tables.lock();
        loop {
            if tables.closed {
                return Err(AcquisitionError::ShuttingDown);
            }

            match tables.entries.get(key).map(|e| e.state) {
                None => {
                    let entry_id = tables.next_id();
                    let handle_id = tables.next_id();
                    let mut entry = WatchEntry::new(entry_id, key.clone());
                    entry.attach(handle_id, listener);
                    tables.entries.insert(key.clone(), entry);
                    drop(tables);

                    tracing::debug!(key = %key, "Acquiring watch resource");
                    return self.acquire(key, entry_id, handle_id, false);
                }
                Some(WatchState::Starting | WatchState::Stopping) => {
                    self.shared.changed.wait(&mut tables);
                }
                Some(WatchState::Watching | WatchState::Reconnecting) => {
                    let handle_id = tables.next_id();
                    let Some(entry) = tables.entries.get_mut(key) else {
                        continue;
                    };
                    entry.attach(handle_id, listener);
                    tracing::debug!(key = %key, refcount = entry.refcount, "Watch shared");
                    return Ok(SubscriptionHandle {
                        key: key.clone(),
                        entry_id: entry.id,
                        id: handle_id,
                    });
                }
                Some(WatchState::Errored) => {
                    let handle_id = tables.next_id();
                    let Some(entry) = tables.entries.get_mut(key) else {
                        continue;
                    };
                    entry.state = WatchState::Starting;
                    entry.generation += 1;
                    entry.attach(handle_id, listener);
                    let entry_id = entry.id;
                    let previous = entry.worker.take();
                    drop(tables);

                    tracing::info!(key = %key, "Re-acquiring errored watch");
                    if let Some(worker) = previous {
                        worker.finish(key, self.shared.teardown_timeout);
                    }
                    return self.acquire(key, entry_id, handle_id, true);
                }
            }
        }
    }

    /// Open the resource for a `Starting` entry and start its worker.
    fn acquire(
        &self,
        key: &WatchKey,
        entry_id: u64,
        handle_id: u64,
        rearm: bool,
    ) -> Result<SubscriptionHandle, AcquisitionError> {
        let opened = self.shared.backend.open_watch(key);

        let mut tables = self.shared.tables.lock();
        let closed = tables.closed;
        let mut orphan: Option<Box<dyn WatchResource>> = None;

        let result = match (tables.entries.get_mut(key), opened) {
            (Some(entry), Ok(resource)) if entry.id == entry_id && !closed => {
                let cancel = resource.cancel_handle();
                match spawn_worker(
                    Arc::clone(&self.shared),
                    key.clone(),
                    entry_id,
                    entry.generation,
                    resource,
                ) {
                    Ok(worker) => {
                        entry.cancel = Some(cancel);
                        entry.worker = Some(worker);
                        entry.state = WatchState::Watching;
                        entry.retry_count = 0;
                        entry.last_error = None;
                        entry.backoff_history.clear();
                        tracing::info!(key = %key, refcount = entry.refcount, "Watch started");
                        Ok(SubscriptionHandle {
                            key: key.clone(),
                            entry_id,
                            id: handle_id,
                        })
                    }
                    Err((err, resource)) => {
                        orphan = resource;
                        Err(AcquisitionError::ConnectionFailed(format!(
                            "failed to start watch worker: {err}"
                        )))
                    }
                }
            }
            (_, Ok(resource)) => {
                orphan = Some(resource);
                Err(AcquisitionError::ShuttingDown)
            }
            (_, Err(err)) => Err(err),
        };

        if let Err(err) = &result {
            Self::roll_back(&mut tables, key, entry_id, handle_id, rearm, err);
        }
        drop(tables);
        self.shared.changed.notify_all();

        if let Some(resource) = orphan {
            resource.close();
        }
        if let Err(err) = &result {
            tracing::warn!(key = %key, error = %err, "Watch acquisition failed");
        }
        result
    }

    /// Undo a failed acquisition. A fresh entry disappears; a re-armed entry
    /// returns to Errored for the subscribers still holding handles.
    fn roll_back(
        tables: &mut MutexGuard<'_, Tables>,
        key: &WatchKey,
        entry_id: u64,
        handle_id: u64,
        rearm: bool,
        err: &AcquisitionError,
    ) {
        let closed = tables.closed;
        let Some(entry) = tables.entries.get_mut(key).filter(|e| e.id == entry_id) else {
            return;
        };
        entry.detach(handle_id);
        if rearm && entry.refcount > 0 && !closed {
            entry.state = WatchState::Errored;
            entry.last_error = Some(err.to_string());
        } else {
            tables.entries.remove(key);
        }
    }

    /// Release one subscription.
    ///
    /// When the last subscription goes, the entry moves to `Stopping`, the
    /// blocked worker is cancelled, and the rest of the teardown runs on a
    /// background thread. Stale or repeated handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> Unsubscribed {
        let key = &handle.key;
        let mut tables = self.shared.tables.lock();
        let Some(entry) = tables.entries.get_mut(key) else {
            return Unsubscribed::NotSubscribed;
        };
        if entry.id != handle.entry_id || !entry.detach(handle.id) {
            return Unsubscribed::NotSubscribed;
        }
        if entry.refcount > 0 {
            tracing::debug!(key = %key, refcount = entry.refcount, "Watch released");
            return Unsubscribed::Released {
                remaining: entry.refcount,
            };
        }

        entry.state = WatchState::Stopping;
        let cancel = entry.cancel.take();
        let worker = entry.worker.take();
        let entry_id = entry.id;
        drop(tables);
        self.shared.changed.notify_all();

        tracing::info!(key = %key, "Last subscriber left, stopping watch");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let (done_tx, done) = std_mpsc::channel();
        let thread_done = done_tx.clone();
        let shared = Arc::clone(&self.shared);
        let teardown_key = key.clone();
        let slot = Arc::new(Mutex::new(worker));
        let thread_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("watch-teardown".to_string())
            .spawn(move || {
                let worker = thread_slot.lock().take();
                if shared.finish_teardown(&teardown_key, entry_id, worker) {
                    let _ = thread_done.send(());
                }
            });

        if let Err(err) = spawned {
            tracing::warn!(key = %key, error = %err, "Failed to spawn teardown thread");
            let worker = slot.lock().take();
            if self.shared.finish_teardown(key, entry_id, worker) {
                let _ = done_tx.send(());
            }
        }

        Unsubscribed::Stopping(Teardown { done })
    }

    /// Tear down every entry and refuse new subscriptions.
    ///
    /// Blocks until all workers exited and all resources were released, or
    /// until the configured shutdown timeout passes.
    pub fn shutdown(&self) -> ShutdownReport {
        self.shutdown_within(self.shared.shutdown_timeout)
    }

    /// [`shutdown`](Self::shutdown) with an explicit deadline.
    pub fn shutdown_within(&self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut stopping = Vec::new();
        {
            let mut tables = self.shared.tables.lock();
            tables.closed = true;
            for entry in tables.entries.values_mut() {
                // Starting entries are rolled back by their acquirer, Stopping
                // ones by their teardown thread.
                if matches!(entry.state, WatchState::Starting | WatchState::Stopping) {
                    continue;
                }
                entry.state = WatchState::Stopping;
                entry.listeners.clear();
                entry.refcount = 0;
                stopping.push((
                    entry.key.clone(),
                    entry.id,
                    entry.cancel.take(),
                    entry.worker.take(),
                ));
            }
        }
        self.shared.changed.notify_all();

        tracing::info!(entries = stopping.len(), "Shutting down watch registry");
        for (_, _, cancel, _) in &stopping {
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
        }

        let mut report = ShutdownReport::default();
        for (key, entry_id, _, worker) in stopping {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let clean = worker.map_or(true, |w| w.finish(&key, remaining));
            if clean {
                report.stopped += 1;
            } else {
                report.abandoned += 1;
            }
            self.shared.remove_entry(&key, entry_id);
        }

        let mut tables = self.shared.tables.lock();
        while !tables.entries.is_empty() {
            if self
                .shared
                .changed
                .wait_until(&mut tables, deadline)
                .timed_out()
            {
                let leftover = tables.entries.len();
                tracing::warn!(
                    entries = leftover,
                    "Shutdown deadline passed, abandoning remaining watches"
                );
                report.abandoned += leftover;
                tables.entries.clear();
                break;
            }
        }
        drop(tables);

        tracing::info!(
            stopped = report.stopped,
            abandoned = report.abandoned,
            "Watch registry shut down"
        );
        report
    }

    /// Snapshot of every entry, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let tables = self.shared.tables.lock();
        let mut entries: Vec<_> = tables.entries.values().map(WatchEntry::snapshot).collect();
        drop(tables);
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Snapshot of the entry for `key`, if one exists.
    #[must_use]
    pub fn entry(&self, key: &WatchKey) -> Option<EntrySnapshot> {
        self.shared.tables.lock().entries.get(key).map(WatchEntry::snapshot)
    }

    /// Number of live entries, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.tables.lock().entries.len()
    }

    /// Whether no entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.tables.lock().closed
    }

    /// Retry policy applied by workers.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingListener, ScriptedBackend, WaitStep};
    use crate::watch::{ChangeType, RawChange};

    const WAIT: Duration = Duration::from_secs(5);

    fn registry(backend: &Arc<ScriptedBackend>, max_retries: u32) -> WatchRegistry {
        WatchRegistry::with_policy(
            Arc::clone(backend) as Arc<dyn WatchBackend>,
            RetryPolicy::fixed(max_retries, Duration::from_millis(1), Duration::from_millis(8)),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }

    fn stopping(outcome: Unsubscribed) -> Teardown {
        match outcome {
            Unsubscribed::Stopping(teardown) => teardown,
            other => panic!("expected Stopping, got {other:?}"),
        }
    }

    #[test]
    fn test_first_subscriber_acquires_second_shares() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");

        let h1 = registry.subscribe(&key, RecordingListener::new()).unwrap();
        assert_eq!(backend.opens(&key), 1);
        assert_eq!(registry.entry(&key).unwrap().refcount, 1);
        assert_eq!(registry.entry(&key).unwrap().state, WatchState::Watching);

        let h2 = registry.subscribe(&key, RecordingListener::new()).unwrap();
        assert_eq!(backend.opens(&key), 1);
        assert_eq!(registry.entry(&key).unwrap().refcount, 2);
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_last_unsubscribe_closes_exactly_once() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");

        let h1 = registry.subscribe(&key, RecordingListener::new()).unwrap();
        let h2 = registry.subscribe(&key, RecordingListener::new()).unwrap();

        assert!(matches!(
            registry.unsubscribe(&h1),
            Unsubscribed::Released { remaining: 1 }
        ));
        assert_eq!(backend.closes(&key), 0);

        let teardown = stopping(registry.unsubscribe(&h2));
        assert!(teardown.wait(WAIT));
        assert_eq!(backend.closes(&key), 1);
        assert_eq!(backend.cancels(&key), 1);
        assert!(registry.entry(&key).is_none());
    }

    #[test]
    fn test_double_unsubscribe_is_ignored() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");

        let h1 = registry.subscribe(&key, RecordingListener::new()).unwrap();
        let _h2 = registry.subscribe(&key, RecordingListener::new()).unwrap();

        registry.unsubscribe(&h1);
        assert!(matches!(registry.unsubscribe(&h1), Unsubscribed::NotSubscribed));
        assert_eq!(registry.entry(&key).unwrap().refcount, 1);
    }

    #[test]
    fn test_acquisition_failure_is_reported_and_leaves_no_entry() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "missing");
        backend.fail_next_open(&key, AcquisitionError::PathNotFound("missing".into()));

        let err = registry.subscribe(&key, RecordingListener::new()).unwrap_err();
        assert_eq!(err, AcquisitionError::PathNotFound("missing".into()));
        assert!(registry.entry(&key).is_none());

        // Next attempt acquires from scratch.
        registry.subscribe(&key, RecordingListener::new()).unwrap();
        assert_eq!(backend.opens(&key), 1);
    }

    #[test]
    fn test_change_events_reach_every_listener_in_order() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");
        let a = RecordingListener::new();
        let b = RecordingListener::new();

        registry.subscribe(&key, a.clone()).unwrap();
        registry.subscribe(&key, b.clone()).unwrap();
        backend.push(
            &key,
            WaitStep::Batch(vec![
                RawChange::named(ChangeType::Added, "a.txt"),
                RawChange::named(ChangeType::Modified, "a.txt"),
            ]),
        );
        backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Removed, "a.txt")]));

        for listener in [&a, &b] {
            assert!(listener.wait_for_events(3, WAIT));
            let events = listener.events();
            let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, vec![0, 1, 2]);
            assert_eq!(events[0].change_type, ChangeType::Added);
            assert_eq!(events[2].change_type, ChangeType::Removed);
        }
    }

    #[test]
    fn test_transient_failures_below_limit_keep_watching() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");
        let listener = RecordingListener::new();

        for _ in 0..3 {
            backend.push(&key, WaitStep::Fail(crate::watch::WatchError::Transient("reset".into())));
        }
        backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Added, "x")]));
        registry.subscribe(&key, listener.clone()).unwrap();

        assert!(listener.wait_for_events(1, WAIT));
        let entry = registry.entry(&key).unwrap();
        assert_eq!(entry.state, WatchState::Watching);
        assert_eq!(entry.retry_count, 0);
        assert!(listener.losses().is_empty());
        assert_eq!(backend.opens(&key), 4);
        assert_eq!(backend.closes(&key), 3);
    }

    #[test]
    fn test_permanent_failure_goes_errored_and_rearms_on_subscribe() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");
        let listener = RecordingListener::new();

        backend.push(&key, WaitStep::Fail(crate::watch::WatchError::Permanent("deleted".into())));
        let handle = registry.subscribe(&key, listener.clone()).unwrap();

        assert!(listener.wait_for_losses(1, WAIT));
        let entry = registry.entry(&key).unwrap();
        assert_eq!(entry.state, WatchState::Errored);
        assert_eq!(entry.refcount, 1);
        assert_eq!(backend.live(&key), 0);

        let again = registry.subscribe(&key, RecordingListener::new()).unwrap();
        assert_eq!(registry.entry(&key).unwrap().state, WatchState::Watching);
        assert_eq!(registry.entry(&key).unwrap().refcount, 2);
        assert_eq!(backend.opens(&key), 2);

        registry.unsubscribe(&handle);
        assert!(stopping(registry.unsubscribe(&again)).wait(WAIT));
        assert_eq!(backend.live(&key), 0);
    }

    #[test]
    fn test_subscribe_during_stopping_creates_fresh_entry() {
        let backend = ScriptedBackend::new();
        backend.set_close_delay(Duration::from_millis(100));
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "docs");

        let handle = registry.subscribe(&key, RecordingListener::new()).unwrap();
        let teardown = stopping(registry.unsubscribe(&handle));

        registry.subscribe(&key, RecordingListener::new()).unwrap();
        assert!(teardown.wait(WAIT));
        assert_eq!(backend.opens(&key), 2);
        assert_eq!(backend.closes(&key), 1);
        assert_eq!(backend.max_live(&key), 1);
        assert_eq!(registry.entry(&key).unwrap().state, WatchState::Watching);
    }

    #[test]
    fn test_shutdown_releases_everything_and_refuses_new_subscribers() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let keys: Vec<_> = (0..4).map(|i| WatchKey::new("conn", &format!("d{i}"))).collect();
        for key in &keys {
            registry.subscribe(key, RecordingListener::new()).unwrap();
        }

        let report = registry.shutdown();
        assert_eq!(report, ShutdownReport { stopped: 4, abandoned: 0 });
        assert!(registry.is_empty());
        for key in &keys {
            assert_eq!(backend.live(key), 0);
        }

        let err = registry.subscribe(&keys[0], RecordingListener::new()).unwrap_err();
        assert_eq!(err, AcquisitionError::ShuttingDown);
    }

    #[test]
    fn test_wedged_teardown_holds_entry_until_worker_releases() {
        let backend = ScriptedBackend::new();
        let registry = WatchRegistry::with_policy(
            Arc::clone(&backend) as Arc<dyn WatchBackend>,
            RetryPolicy::fixed(5, Duration::from_millis(1), Duration::from_millis(8)),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let key = WatchKey::new("conn", "wedged");
        backend.ignore_cancel(&key);

        let handle = registry.subscribe(&key, RecordingListener::new()).unwrap();
        let teardown = stopping(registry.unsubscribe(&handle));
        assert!(!teardown.wait(WAIT));
        assert_eq!(registry.entry(&key).unwrap().state, WatchState::Stopping);
        assert_eq!(backend.live(&key), 1);

        thread::scope(|scope| {
            let resubscribe = scope.spawn(|| registry.subscribe(&key, RecordingListener::new()));
            thread::sleep(Duration::from_millis(150));
            assert!(!resubscribe.is_finished());
            assert_eq!(backend.opens(&key), 1);

            // Wake the stuck worker; it releases on its way out.
            backend.push(&key, WaitStep::Batch(vec![RawChange::named(ChangeType::Modified, "x")]));
            resubscribe.join().unwrap().unwrap();
        });

        assert_eq!(backend.opens(&key), 2);
        assert_eq!(backend.closes(&key), 1);
        assert_eq!(backend.max_live(&key), 1);
        assert_eq!(registry.entry(&key).unwrap().state, WatchState::Watching);
    }

    #[test]
    fn test_shutdown_abandons_wedged_worker() {
        let backend = ScriptedBackend::new();
        let registry = registry(&backend, 5);
        let key = WatchKey::new("conn", "wedged");
        backend.ignore_cancel(&key);
        registry.subscribe(&key, RecordingListener::new()).unwrap();

        let started = Instant::now();
        let report = registry.shutdown_within(Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(report.abandoned, 1);
        assert!(registry.is_empty());
    }
}
