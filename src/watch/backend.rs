//! Storage backend seam for watch resources.
//!
//! A backend turns a [`WatchKey`] into a live [`WatchResource`]: the full
//! connection → session → share → directory → armed-watch chain. The registry
//! never looks inside the chain; it only relies on the ordering contract:
//!
//! ```text
//! open_watch()         acquire chain in order, or release what was acquired and fail
//! wait_for_changes()   block until the next batch (worker thread only)
//! cancel_handle()      close the lowest-level handle so a blocked wait returns Cancelled
//! close()              release the rest of the chain in reverse order, after the worker exited
//! ```

use std::sync::Arc;

use super::error::{AcquisitionError, WatchError};
use super::event::{ChangeBatch, ChangeEvent};
use super::key::WatchKey;

/// Opens watch resources for a storage backend.
pub trait WatchBackend: Send + Sync {
    /// Acquire the resource chain for `key`.
    ///
    /// # Errors
    ///
    /// Returns an [`AcquisitionError`] if any stage of the chain fails. Stages
    /// acquired before the failure must already be released.
    fn open_watch(&self, key: &WatchKey) -> Result<Box<dyn WatchResource>, AcquisitionError>;
}

/// One armed watch, exclusively owned by its entry's worker.
pub trait WatchResource: Send {
    /// Block until the next change batch. Re-arms internally if needed.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Cancelled`] after the cancel handle fired,
    /// otherwise a transient or permanent classification.
    fn wait_for_changes(&mut self) -> Result<ChangeBatch, WatchError>;

    /// Handle that unblocks `wait_for_changes` from another thread.
    fn cancel_handle(&self) -> Arc<dyn CancelWatch>;

    /// Release the chain in reverse order of acquisition.
    fn close(self: Box<Self>);
}

/// Closes the handle a worker is blocked on. Must be idempotent.
pub trait CancelWatch: Send + Sync {
    fn cancel(&self);
}

/// Receives notifications for one subscription.
///
/// Called on the watch worker thread with no registry locks held. Must not
/// block on I/O.
pub trait WatchListener: Send + Sync {
    /// A change was observed for the subscribed key.
    fn on_change(&self, event: &ChangeEvent);

    /// Watching stopped permanently. Invoked at most once per failure.
    fn on_lost(&self, key: &WatchKey, reason: &str);
}
