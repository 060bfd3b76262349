//! In-memory doubles for exercising the registry and hub without a filesystem.
//!
//! [`ScriptedBackend`] hands out resources whose waits are fed from a
//! per-key script, and counts every acquisition, cancellation and release so
//! tests can check that each resource is released exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::hub::{ServerMessage, Transport};
use crate::watch::{
    AcquisitionError, CancelWatch, ChangeBatch, ChangeEvent, SubscriptionHandle, Unsubscribed,
    WatchBackend, WatchError, WatchKey, WatchListener, WatchRegistry, WatchResource,
    WatchSubscriptions,
};

/// Outcome of one blocking wait on a scripted resource.
#[derive(Debug, Clone)]
pub enum WaitStep {
    Batch(ChangeBatch),
    Fail(WatchError),
}

#[derive(Default)]
struct KeyScript {
    steps: VecDeque<WaitStep>,
    open_failures: VecDeque<AcquisitionError>,
    opens: usize,
    closes: usize,
    cancels: usize,
    live: usize,
    max_live: usize,
    ignore_cancel: bool,
}

#[derive(Default)]
struct ScriptState {
    keys: HashMap<WatchKey, KeyScript>,
    open_delay: Duration,
    close_delay: Duration,
}

#[derive(Default)]
struct ScriptInner {
    state: Mutex<ScriptState>,
    changed: Condvar,
}

/// Backend driven entirely by test scripts.
#[derive(Default)]
pub struct ScriptedBackend {
    inner: Arc<ScriptInner>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the outcome of a future wait on `key`.
    pub fn push(&self, key: &WatchKey, step: WaitStep) {
        self.inner
            .state
            .lock()
            .keys
            .entry(key.clone())
            .or_default()
            .steps
            .push_back(step);
        self.inner.changed.notify_all();
    }

    /// Make the next open of `key` fail with `err`.
    pub fn fail_next_open(&self, key: &WatchKey, err: AcquisitionError) {
        self.inner
            .state
            .lock()
            .keys
            .entry(key.clone())
            .or_default()
            .open_failures
            .push_back(err);
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.inner.state.lock().open_delay = delay;
    }

    /// Delay every close by `delay`.
    pub fn set_close_delay(&self, delay: Duration) {
        self.inner.state.lock().close_delay = delay;
    }

    /// Keep waits on `key` blocked even after cancellation.
    pub fn ignore_cancel(&self, key: &WatchKey) {
        self.inner
            .state
            .lock()
            .keys
            .entry(key.clone())
            .or_default()
            .ignore_cancel = true;
    }

    /// Successful opens of `key`.
    #[must_use]
    pub fn opens(&self, key: &WatchKey) -> usize {
        self.read(key, |s| s.opens)
    }

    #[must_use]
    pub fn closes(&self, key: &WatchKey) -> usize {
        self.read(key, |s| s.closes)
    }

    #[must_use]
    pub fn cancels(&self, key: &WatchKey) -> usize {
        self.read(key, |s| s.cancels)
    }

    /// Resources for `key` opened and not yet closed.
    #[must_use]
    pub fn live(&self, key: &WatchKey) -> usize {
        self.read(key, |s| s.live)
    }

    /// Highest number of simultaneously live resources for `key`.
    #[must_use]
    pub fn max_live(&self, key: &WatchKey) -> usize {
        self.read(key, |s| s.max_live)
    }

    /// Block until `key` has no live resources. Returns false on timeout.
    #[must_use]
    pub fn wait_until_released(&self, key: &WatchKey, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.keys.get(key).is_some_and(|s| s.live > 0) {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    fn read(&self, key: &WatchKey, f: impl FnOnce(&KeyScript) -> usize) -> usize {
        self.inner.state.lock().keys.get(key).map_or(0, f)
    }
}

impl WatchBackend for ScriptedBackend {
    fn open_watch(&self, key: &WatchKey) -> Result<Box<dyn WatchResource>, AcquisitionError> {
        let delay = self.inner.state.lock().open_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.inner.state.lock();
        let script = state.keys.entry(key.clone()).or_default();
        if let Some(err) = script.open_failures.pop_front() {
            return Err(err);
        }
        script.opens += 1;
        script.live += 1;
        script.max_live = script.max_live.max(script.live);

        Ok(Box::new(ScriptedResource {
            key: key.clone(),
            inner: Arc::clone(&self.inner),
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct ScriptedResource {
    key: WatchKey,
    inner: Arc<ScriptInner>,
    cancelled: Arc<AtomicBool>,
}

impl WatchResource for ScriptedResource {
    fn wait_for_changes(&mut self) -> Result<ChangeBatch, WatchError> {
        let mut state = self.inner.state.lock();
        loop {
            let script = state.keys.entry(self.key.clone()).or_default();
            if self.cancelled.load(Ordering::SeqCst) && !script.ignore_cancel {
                return Err(WatchError::Cancelled);
            }
            match script.steps.pop_front() {
                Some(WaitStep::Batch(batch)) => return Ok(batch),
                Some(WaitStep::Fail(err)) => return Err(err),
                None => self.inner.changed.wait(&mut state),
            }
        }
    }

    fn cancel_handle(&self) -> Arc<dyn CancelWatch> {
        Arc::new(ScriptedCancel {
            key: self.key.clone(),
            inner: Arc::clone(&self.inner),
            cancelled: Arc::clone(&self.cancelled),
        })
    }

    fn close(self: Box<Self>) {
        let delay = self.inner.state.lock().close_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = self.inner.state.lock();
        let script = state.keys.entry(self.key.clone()).or_default();
        script.closes += 1;
        script.live = script.live.saturating_sub(1);
        drop(state);
        self.inner.changed.notify_all();
    }
}

struct ScriptedCancel {
    key: WatchKey,
    inner: Arc<ScriptInner>,
    cancelled: Arc<AtomicBool>,
}

impl CancelWatch for ScriptedCancel {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .state
            .lock()
            .keys
            .entry(self.key.clone())
            .or_default()
            .cancels += 1;
        self.inner.changed.notify_all();
    }
}

/// Listener that records everything it is told.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ChangeEvent>>,
    losses: Mutex<Vec<(WatchKey, String)>>,
    signal: Condvar,
    gate: Mutex<()>,
}

impl RecordingListener {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn losses(&self) -> Vec<(WatchKey, String)> {
        self.losses.lock().clone()
    }

    /// Block until at least `n` events arrived. Returns false on timeout.
    #[must_use]
    pub fn wait_for_events(&self, n: usize, timeout: Duration) -> bool {
        self.wait(timeout, || self.events.lock().len() >= n)
    }

    /// Block until at least `n` losses arrived. Returns false on timeout.
    #[must_use]
    pub fn wait_for_losses(&self, n: usize, timeout: Duration) -> bool {
        self.wait(timeout, || self.losses.lock().len() >= n)
    }

    fn wait(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while !done() {
            if self.signal.wait_until(&mut gate, deadline).timed_out() {
                return done();
            }
        }
        true
    }

    fn notify(&self) {
        let _gate = self.gate.lock();
        self.signal.notify_all();
    }
}

impl WatchListener for RecordingListener {
    fn on_change(&self, event: &ChangeEvent) {
        self.events.lock().push(event.clone());
        self.notify();
    }

    fn on_lost(&self, key: &WatchKey, reason: &str) {
        self.losses.lock().push((key.clone(), reason.to_string()));
        self.notify();
    }
}

/// Transport that keeps every message per session.
#[derive(Default)]
pub struct RecordingTransport {
    sessions: Mutex<HashMap<String, Vec<ServerMessage>>>,
    broken: Mutex<HashSet<String>>,
    signal: Condvar,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Silently drop everything sent to `session_id` from now on.
    pub fn break_session(&self, session_id: &str) {
        self.broken.lock().insert(session_id.to_string());
    }

    #[must_use]
    pub fn messages(&self, session_id: &str) -> Vec<ServerMessage> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Block until `session_id` received at least `n` messages.
    #[must_use]
    pub fn wait_for_count(&self, session_id: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sessions = self.sessions.lock();
        while sessions.get(session_id).map_or(0, Vec::len) < n {
            if self.signal.wait_until(&mut sessions, deadline).timed_out() {
                return sessions.get(session_id).map_or(0, Vec::len) >= n;
            }
        }
        true
    }
}

impl Transport for RecordingTransport {
    fn send(&self, session_id: &str, message: ServerMessage) {
        if self.broken.lock().contains(session_id) {
            return;
        }
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        self.signal.notify_all();
    }
}

/// Registry wrapper that counts subscribe and unsubscribe calls per key.
pub struct CountingSubscriptions {
    registry: WatchRegistry,
    subscribes: Mutex<HashMap<WatchKey, usize>>,
    unsubscribes: Mutex<HashMap<WatchKey, usize>>,
}

impl CountingSubscriptions {
    #[must_use]
    pub fn new(registry: WatchRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            subscribes: Mutex::new(HashMap::new()),
            unsubscribes: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    /// Successful subscribe calls for `key`.
    #[must_use]
    pub fn subscribes(&self, key: &WatchKey) -> usize {
        self.subscribes.lock().get(key).copied().unwrap_or(0)
    }

    /// Unsubscribe calls for `key`, including ignored ones.
    #[must_use]
    pub fn unsubscribes(&self, key: &WatchKey) -> usize {
        self.unsubscribes.lock().get(key).copied().unwrap_or(0)
    }
}

impl WatchSubscriptions for CountingSubscriptions {
    fn subscribe(
        &self,
        key: &WatchKey,
        listener: Arc<dyn WatchListener>,
    ) -> Result<SubscriptionHandle, AcquisitionError> {
        let handle = self.registry.subscribe(key, listener)?;
        *self.subscribes.lock().entry(key.clone()).or_default() += 1;
        Ok(handle)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Unsubscribed {
        *self
            .unsubscribes
            .lock()
            .entry(handle.key().clone())
            .or_default() += 1;
        self.registry.unsubscribe(handle)
    }
}
