//! Shared directory-change watches.
//!
//! A [`WatchRegistry`] owns at most one live watch per [`WatchKey`] and hands
//! out refcounted subscriptions to it. Each live watch runs a dedicated worker
//! thread that blocks on the backend's change notification, stamps events with
//! a per-entry sequence number and delivers them to every current listener.

mod backend;
mod entry;
mod error;
mod event;
mod key;
mod local;
mod registry;
mod retry;

pub use backend::{CancelWatch, WatchBackend, WatchListener, WatchResource};
pub use entry::{EntrySnapshot, WatchState};
pub use error::{AcquisitionError, WatchError};
pub use event::{ChangeBatch, ChangeEvent, ChangeType, RawChange};
pub use key::{normalize_path, WatchKey};
pub use local::LocalBackend;
pub use registry::{
    ShutdownReport, SubscriptionHandle, Teardown, Unsubscribed, WatchRegistry, WatchSubscriptions,
};
pub use retry::RetryPolicy;
