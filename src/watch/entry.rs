//! Watch entry state machine and its background worker.
//!
//! Each live [`WatchKey`] has exactly one entry. The entry's record lives in
//! the registry table (guarded by the registry lock); the resource chain lives
//! on the worker thread and is never touched by anyone else while the worker
//! runs. Teardown follows a fixed order:
//!
//! 1. mark the entry `Stopping` (under the registry lock)
//! 2. fire the cancel handle, which closes the handle the worker is blocked on
//! 3. wait for the worker to exit and hand the resource back
//! 4. release the rest of the chain with [`WatchResource::close`]

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::backend::{CancelWatch, WatchListener, WatchResource};
use super::error::WatchError;
use super::event::{ChangeEvent, RawChange};
use super::key::WatchKey;
use super::registry::RegistryShared;

/// Lifecycle state of a watch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchState {
    /// Resource acquisition in progress; other subscribers wait.
    Starting,
    /// Worker blocked on the resource.
    Watching,
    /// Worker backing off or re-acquiring after a transient failure.
    Reconnecting,
    /// Last subscriber left; teardown in progress. Nobody may attach.
    Stopping,
    /// Watching stopped permanently; a fresh subscribe re-acquires.
    Errored,
}

impl WatchState {
    /// Whether the entry is serving (or about to serve) subscribers.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Watching | Self::Reconnecting)
    }
}

/// Registry-side record for one watch key.
pub(crate) struct WatchEntry {
    pub(crate) id: u64,
    pub(crate) key: WatchKey,
    pub(crate) state: WatchState,
    pub(crate) refcount: usize,
    /// Bumped whenever a new worker is started for this entry.
    pub(crate) generation: u64,
    /// Listeners keyed by subscription handle id, dispatched in subscribe order.
    pub(crate) listeners: BTreeMap<u64, Arc<dyn WatchListener>>,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) backoff_history: Vec<Duration>,
    pub(crate) cancel: Option<Arc<dyn CancelWatch>>,
    pub(crate) worker: Option<WorkerHandle>,
    pub(crate) next_sequence: u64,
    pub(crate) created_at: DateTime<Utc>,
}

impl WatchEntry {
    pub(crate) fn new(id: u64, key: WatchKey) -> Self {
        Self {
            id,
            key,
            state: WatchState::Starting,
            refcount: 0,
            generation: 0,
            listeners: BTreeMap::new(),
            retry_count: 0,
            last_error: None,
            backoff_history: Vec::new(),
            cancel: None,
            worker: None,
            next_sequence: 0,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn attach(&mut self, handle_id: u64, listener: Arc<dyn WatchListener>) {
        self.listeners.insert(handle_id, listener);
        self.refcount += 1;
    }

    /// Returns false if the handle was not attached.
    pub(crate) fn detach(&mut self, handle_id: u64) -> bool {
        if self.listeners.remove(&handle_id).is_none() {
            return false;
        }
        self.refcount = self.refcount.saturating_sub(1);
        true
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            state: self.state,
            refcount: self.refcount,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            backoff_history: self.backoff_history.clone(),
            events_delivered: self.next_sequence,
            created_at: self.created_at,
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn WatchListener>> {
        self.listeners.values().cloned().collect()
    }
}

/// Point-in-time view of an entry, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySnapshot {
    pub key: WatchKey,
    pub state: WatchState,
    pub refcount: usize,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub backoff_history: Vec<Duration>,
    pub events_delivered: u64,
    pub created_at: DateTime<Utc>,
}

pub(crate) type ExitSlot = Option<Box<dyn WatchResource>>;

enum ExitState {
    Running,
    /// Worker left its loop; the owner releases whatever it handed back.
    Exited(ExitSlot),
    /// Owner stopped waiting; the worker releases on its own way out.
    Abandoned,
}

/// Hand-off point between a worker and its owner. Whoever flips the state
/// first decides who releases the resource.
struct ExitCell {
    state: Mutex<ExitState>,
    exited: Condvar,
}

/// Owner-side handle for a worker thread.
pub(crate) struct WorkerHandle {
    thread: thread::JoinHandle<()>,
    exit: Arc<ExitCell>,
}

impl WorkerHandle {
    /// Wait up to `timeout` for the worker to exit, then release its resource.
    ///
    /// Returns false if the worker did not exit in time. The thread is then
    /// abandoned: when it does exit it closes the resource itself and removes
    /// its entry if that entry is still stopping.
    pub(crate) fn finish(self, key: &WatchKey, timeout: Duration) -> bool {
        let own_thread = self.thread.thread().id() == thread::current().id();
        let deadline = Instant::now() + timeout;

        let mut state = self.exit.state.lock();
        if !own_thread {
            while matches!(*state, ExitState::Running) {
                if self.exit.exited.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        let outcome = std::mem::replace(&mut *state, ExitState::Abandoned);
        drop(state);

        match outcome {
            ExitState::Exited(resource) => {
                let _ = self.thread.join();
                if let Some(resource) = resource {
                    resource.close();
                }
                true
            }
            ExitState::Running | ExitState::Abandoned if own_thread => {
                tracing::debug!(key = %key, "Teardown requested from worker thread, detaching");
                false
            }
            ExitState::Running | ExitState::Abandoned => {
                tracing::warn!(
                    key = %key,
                    timeout_ms = timeout.as_millis(),
                    "Watch worker did not exit in time, abandoning it"
                );
                false
            }
        }
    }
}

/// Start the worker for an entry whose resource was just acquired.
///
/// If the thread cannot be spawned the resource is handed back unreleased.
pub(crate) fn spawn_worker(
    shared: Arc<RegistryShared>,
    key: WatchKey,
    entry_id: u64,
    generation: u64,
    resource: Box<dyn WatchResource>,
) -> Result<WorkerHandle, (std::io::Error, ExitSlot)> {
    let exit = Arc::new(ExitCell {
        state: Mutex::new(ExitState::Running),
        exited: Condvar::new(),
    });
    let thread_exit = Arc::clone(&exit);
    let slot = Arc::new(Mutex::new(Some(resource)));
    let thread_slot = Arc::clone(&slot);

    let worker = Worker {
        shared,
        key: key.clone(),
        entry_id,
        generation,
    };

    let spawned = thread::Builder::new()
        .name(format!("watch-{}", key.connection_id()))
        .spawn(move || {
            let Some(resource) = thread_slot.lock().take() else {
                return;
            };
            let leftover = catch_unwind(AssertUnwindSafe(|| worker.run(resource)))
                .unwrap_or_else(|_| {
                    tracing::error!(key = %worker.key, "Watch worker panicked");
                    None
                });
            worker.exit(&thread_exit, leftover);
        });

    match spawned {
        Ok(thread) => Ok(WorkerHandle { thread, exit }),
        Err(err) => Err((err, slot.lock().take())),
    }
}

/// The worker loop for one entry generation.
struct Worker {
    shared: Arc<RegistryShared>,
    key: WatchKey,
    entry_id: u64,
    generation: u64,
}

enum Step<T> {
    Continue(T),
    Stop,
}

impl Worker {
    /// Run until cancelled or failed. Returns the resource if it is still held.
    fn run(&self, mut resource: Box<dyn WatchResource>) -> ExitSlot {
        tracing::debug!(key = %self.key, generation = self.generation, "Watch worker started");

        loop {
            match resource.wait_for_changes() {
                Ok(batch) => {
                    if self.deliver(batch).is_err() {
                        return Some(resource);
                    }
                }
                Err(WatchError::Cancelled) => {
                    tracing::debug!(key = %self.key, "Watch cancelled");
                    return Some(resource);
                }
                Err(_) if self.stop_requested() => return Some(resource),
                Err(WatchError::Permanent(reason)) => {
                    resource.close();
                    self.fail(&reason);
                    return None;
                }
                Err(WatchError::Transient(reason)) => {
                    resource.close();
                    match self.reconnect(reason) {
                        Step::Continue(fresh) => resource = fresh,
                        Step::Stop => return None,
                    }
                }
            }
        }
    }

    /// Stamp and dispatch one batch. Err means the entry is stopping.
    fn deliver(&self, batch: Vec<RawChange>) -> Result<(), ()> {
        let reset = self.with_entry(|entry| {
            entry.retry_count = 0;
            entry.backoff_history.clear();
        });
        if reset.is_none() {
            return Err(());
        }

        for change in batch {
            // Listener set is sampled per event, at the moment of delivery.
            let Some((event, listeners)) = self.with_entry(|entry| {
                let event = ChangeEvent {
                    key: entry.key.clone(),
                    change_type: change.change_type,
                    name: change.name.clone(),
                    sequence: entry.next_sequence,
                };
                entry.next_sequence += 1;
                (event, entry.listener_snapshot())
            }) else {
                return Err(());
            };

            tracing::debug!(
                key = %self.key,
                change = event.change_type.as_str(),
                name = event.name.as_deref().unwrap_or(""),
                sequence = event.sequence,
                listeners = listeners.len(),
                "Dispatching change"
            );

            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener.on_change(&event))).is_err() {
                    tracing::warn!(key = %self.key, "Change listener panicked");
                }
            }
        }
        Ok(())
    }

    /// Back off and re-acquire until success, exhaustion, or teardown.
    fn reconnect(&self, mut reason: String) -> Step<Box<dyn WatchResource>> {
        loop {
            let policy = &self.shared.policy;
            let Some(decision) = self.with_entry(|entry| {
                entry.retry_count += 1;
                entry.last_error = Some(reason.clone());
                entry.cancel = None;
                if policy.exhausted(entry.retry_count) {
                    return None;
                }
                entry.state = WatchState::Reconnecting;
                let delay = policy.delay_for(entry.retry_count);
                entry.backoff_history.push(delay);
                Some((entry.retry_count, delay))
            }) else {
                return Step::Stop;
            };

            let Some((attempt, delay)) = decision else {
                self.fail(&format!(
                    "giving up after {} consecutive failures: {reason}",
                    policy.max_retries
                ));
                return Step::Stop;
            };

            tracing::warn!(
                key = %self.key,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis(),
                error = %reason,
                "Watch failed, reconnecting"
            );

            if !self.sleep(delay) {
                return Step::Stop;
            }

            match self.shared.backend.open_watch(&self.key) {
                Ok(fresh) => {
                    let cancel = fresh.cancel_handle();
                    let installed = self.with_entry(|entry| {
                        entry.cancel = Some(cancel);
                        entry.state = WatchState::Watching;
                        entry.retry_count = 0;
                        entry.backoff_history.clear();
                    });
                    if installed.is_none() {
                        fresh.close();
                        return Step::Stop;
                    }
                    tracing::info!(key = %self.key, attempt, "Watch reconnected");
                    return Step::Continue(fresh);
                }
                Err(err) => match WatchError::from(err) {
                    WatchError::Transient(next) => reason = next,
                    WatchError::Permanent(next) => {
                        self.fail(&next);
                        return Step::Stop;
                    }
                    WatchError::Cancelled => return Step::Stop,
                },
            }
        }
    }

    /// Hand the leftover resource to the owner, or release it here if the
    /// owner already gave up waiting.
    fn exit(&self, cell: &ExitCell, leftover: ExitSlot) {
        let mut state = cell.state.lock();
        if matches!(*state, ExitState::Running) {
            *state = ExitState::Exited(leftover);
            drop(state);
            cell.exited.notify_all();
            return;
        }
        drop(state);

        if let Some(resource) = leftover {
            resource.close();
        }
        tracing::info!(key = %self.key, "Abandoned watch worker exited");
        self.shared.remove_abandoned(&self.key, self.entry_id, self.generation);
    }

    /// Transition to Errored and notify every listener once.
    fn fail(&self, reason: &str) {
        let Some(listeners) = self.with_entry(|entry| {
            entry.state = WatchState::Errored;
            entry.last_error = Some(reason.to_string());
            entry.cancel = None;
            entry.listener_snapshot()
        }) else {
            return;
        };
        self.shared.changed.notify_all();

        tracing::error!(key = %self.key, reason, "Watch lost");

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_lost(&self.key, reason))).is_err() {
                tracing::warn!(key = %self.key, "Loss listener panicked");
            }
        }
    }

    /// Sleep for `delay` unless teardown starts. Returns false if stopped.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut tables = self.shared.tables.lock();
        loop {
            if !self.is_current(tables.entries.get(&self.key)) {
                return false;
            }
            if self
                .shared
                .changed
                .wait_until(&mut tables, deadline)
                .timed_out()
            {
                return self.is_current(tables.entries.get(&self.key));
            }
        }
    }

    fn stop_requested(&self) -> bool {
        let tables = self.shared.tables.lock();
        !self.is_current(tables.entries.get(&self.key))
    }

    fn is_current(&self, entry: Option<&WatchEntry>) -> bool {
        entry.is_some_and(|e| {
            e.id == self.entry_id && e.generation == self.generation && e.state != WatchState::Stopping
        })
    }

    /// Run `f` on this worker's entry under the registry lock, unless the
    /// entry is gone, replaced, or stopping.
    fn with_entry<R>(&self, f: impl FnOnce(&mut WatchEntry) -> R) -> Option<R> {
        let mut tables = self.shared.tables.lock();
        let entry = tables.entries.get_mut(&self.key)?;
        if !self.is_current(Some(entry)) {
            return None;
        }
        Some(f(entry))
    }
}
