//! Local-directory backend built on `notify`.
//!
//! Each connection id maps to a root directory. A key's path is resolved
//! below that root, matching each segment case-insensitively when no exact
//! match exists, and watched recursively.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::backend::{CancelWatch, WatchBackend, WatchResource};
use super::error::{AcquisitionError, WatchError};
use super::event::{ChangeBatch, ChangeType, RawChange};
use super::key::WatchKey;
use crate::config::ConnectionConfig;

/// Backend serving directories from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    roots: HashMap<String, PathBuf>,
}

impl LocalBackend {
    /// Create a backend from configured connections.
    #[must_use]
    pub fn new(connections: &[ConnectionConfig]) -> Self {
        Self::from_roots(connections.iter().map(|c| (c.id.clone(), c.root.clone())))
    }

    /// Create a backend from `(connection id, root)` pairs.
    pub fn from_roots<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = (S, PathBuf)>,
        S: Into<String>,
    {
        Self {
            roots: roots
                .into_iter()
                .map(|(id, root)| (id.into(), root))
                .collect(),
        }
    }

    /// Root directory of a connection.
    #[must_use]
    pub fn root(&self, connection_id: &str) -> Option<&Path> {
        self.roots.get(connection_id).map(PathBuf::as_path)
    }

    fn resolve(&self, key: &WatchKey) -> Result<PathBuf, AcquisitionError> {
        let root = self
            .roots
            .get(key.connection_id())
            .ok_or_else(|| AcquisitionError::UnknownConnection(key.connection_id().to_string()))?;
        if !root.is_dir() {
            return Err(AcquisitionError::ConnectionFailed(format!(
                "share root unavailable: {}",
                root.display()
            )));
        }

        let mut dir = root.clone();
        for segment in key.path().split('/').filter(|s| !s.is_empty()) {
            if segment == ".." {
                return Err(AcquisitionError::PathNotFound(key.path().to_string()));
            }
            dir = resolve_segment(&dir, segment, key)?;
        }

        if !dir.is_dir() {
            return Err(AcquisitionError::PathNotFound(key.path().to_string()));
        }
        fs::read_dir(&dir).map_err(|err| io_to_acquisition(&err, key))?;
        dir.canonicalize()
            .map_err(|err| io_to_acquisition(&err, key))
    }
}

fn resolve_segment(parent: &Path, segment: &str, key: &WatchKey) -> Result<PathBuf, AcquisitionError> {
    let exact = parent.join(segment);
    if exact.exists() {
        return Ok(exact);
    }

    let entries = fs::read_dir(parent).map_err(|err| io_to_acquisition(&err, key))?;
    entries
        .filter_map(Result::ok)
        .find(|entry| entry.file_name().to_string_lossy().to_lowercase() == segment.to_lowercase())
        .map(|entry| entry.path())
        .ok_or_else(|| AcquisitionError::PathNotFound(key.path().to_string()))
}

fn io_to_acquisition(err: &io::Error, key: &WatchKey) -> AcquisitionError {
    match err.kind() {
        io::ErrorKind::NotFound => AcquisitionError::PathNotFound(key.path().to_string()),
        io::ErrorKind::PermissionDenied => AcquisitionError::PermissionDenied(key.path().to_string()),
        _ => AcquisitionError::ConnectionFailed(err.to_string()),
    }
}

fn notify_to_acquisition(err: &notify::Error, key: &WatchKey) -> AcquisitionError {
    match &err.kind {
        notify::ErrorKind::PathNotFound => AcquisitionError::PathNotFound(key.path().to_string()),
        notify::ErrorKind::Io(io_err) => io_to_acquisition(io_err, key),
        _ => AcquisitionError::ConnectionFailed(err.to_string()),
    }
}

impl WatchBackend for LocalBackend {
    fn open_watch(&self, key: &WatchKey) -> Result<Box<dyn WatchResource>, AcquisitionError> {
        let dir = self.resolve(key)?;

        let (tx, rx) = std_mpsc::channel();
        let event_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = event_tx.send(Signal::Event(res));
        })
        .map_err(|err| notify_to_acquisition(&err, key))?;

        // Dropping the unarmed watcher on failure releases everything acquired so far.
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|err| notify_to_acquisition(&err, key))?;

        tracing::debug!(key = %key, dir = %dir.display(), "Local watch armed");
        Ok(Box::new(LocalWatch {
            key: key.clone(),
            dir,
            rx,
            pending: None,
            cancel: Arc::new(LocalCancel {
                watcher: Mutex::new(Some(watcher)),
                tx,
            }),
        }))
    }
}

enum Signal {
    Event(notify::Result<notify::Event>),
    Closed,
}

struct LocalCancel {
    watcher: Mutex<Option<RecommendedWatcher>>,
    tx: std_mpsc::Sender<Signal>,
}

impl LocalCancel {
    /// Drop the armed watcher. Returns false if it was already gone.
    fn disarm(&self) -> bool {
        self.watcher.lock().take().is_some()
    }
}

impl CancelWatch for LocalCancel {
    fn cancel(&self) {
        if self.disarm() {
            let _ = self.tx.send(Signal::Closed);
        }
    }
}

struct LocalWatch {
    key: WatchKey,
    dir: PathBuf,
    rx: std_mpsc::Receiver<Signal>,
    /// Error held back so the changes drained before it are delivered first.
    pending: Option<WatchError>,
    cancel: Arc<LocalCancel>,
}

impl LocalWatch {
    fn absorb(&self, signal: Signal, batch: &mut ChangeBatch) -> Result<(), WatchError> {
        match signal {
            Signal::Closed => Err(WatchError::Cancelled),
            Signal::Event(Err(err)) => Err(classify(&err)),
            Signal::Event(Ok(event)) => {
                batch.extend(map_event(&self.dir, &event)?);
                Ok(())
            }
        }
    }
}

impl WatchResource for LocalWatch {
    fn wait_for_changes(&mut self) -> Result<ChangeBatch, WatchError> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }

        let mut batch = ChangeBatch::new();
        while batch.is_empty() {
            let first = self.rx.recv().map_err(|_| WatchError::Cancelled)?;
            self.absorb(first, &mut batch)?;

            while let Ok(signal) = self.rx.try_recv() {
                if let Err(err) = self.absorb(signal, &mut batch) {
                    if batch.is_empty() {
                        return Err(err);
                    }
                    self.pending = Some(err);
                    break;
                }
            }
        }
        Ok(batch)
    }

    fn cancel_handle(&self) -> Arc<dyn CancelWatch> {
        Arc::clone(&self.cancel) as Arc<dyn CancelWatch>
    }

    fn close(self: Box<Self>) {
        if self.cancel.disarm() {
            tracing::debug!(key = %self.key, "Local watcher disarmed");
        }
        tracing::debug!(key = %self.key, dir = %self.dir.display(), "Local watch released");
    }
}

fn classify(err: &notify::Error) -> WatchError {
    match &err.kind {
        notify::ErrorKind::PathNotFound
        | notify::ErrorKind::WatchNotFound
        | notify::ErrorKind::MaxFilesWatch
        | notify::ErrorKind::InvalidConfig(_) => WatchError::Permanent(err.to_string()),
        notify::ErrorKind::Io(_) | notify::ErrorKind::Generic(_) => {
            WatchError::Transient(err.to_string())
        }
    }
}

/// Translate one notify event into changes relative to `dir`.
fn map_event(dir: &Path, event: &notify::Event) -> Result<Vec<RawChange>, WatchError> {
    let change = |change_type, path: &PathBuf| RawChange::new(change_type, relative_name(dir, path));

    let changes = match event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| change(ChangeType::Added, p)).collect(),
        EventKind::Remove(_) => {
            if event.paths.iter().any(|p| p == dir) {
                return Err(WatchError::Permanent(format!(
                    "watched directory removed: {}",
                    dir.display()
                )));
            }
            event.paths.iter().map(|p| change(ChangeType::Removed, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| change(ChangeType::RenamedFrom, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| change(ChangeType::RenamedTo, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to, ..] => vec![change(ChangeType::RenamedFrom, from), change(ChangeType::RenamedTo, to)],
            paths => paths.iter().map(|p| change(ChangeType::Modified, p)).collect(),
        },
        EventKind::Modify(_) => event.paths.iter().map(|p| change(ChangeType::Modified, p)).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };
    Ok(changes)
}

fn relative_name(dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(dir).ok()?;
    let name = relative.to_string_lossy().replace('\\', "/");
    (!name.is_empty()).then_some(name)
}
