//! Change events produced by watch workers.

use serde::{Deserialize, Serialize};

use super::key::WatchKey;

/// Kind of change reported for one directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    RenamedFrom,
    RenamedTo,
}

impl ChangeType {
    /// Stable lowercase label used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::RenamedFrom => "renamed_from",
            Self::RenamedTo => "renamed_to",
        }
    }
}

/// A raw change as reported by a backend, before the worker stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub change_type: ChangeType,
    pub name: Option<String>,
}

impl RawChange {
    #[must_use]
    pub fn new(change_type: ChangeType, name: Option<String>) -> Self {
        Self { change_type, name }
    }

    /// Shorthand for a change with a known entry name.
    #[must_use]
    pub fn named(change_type: ChangeType, name: impl Into<String>) -> Self {
        Self::new(change_type, Some(name.into()))
    }
}

/// The ordered result of one successful blocking wait. May be empty.
pub type ChangeBatch = Vec<RawChange>;

/// A change delivered to listeners.
///
/// `sequence` is strictly increasing per watch entry, across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub key: WatchKey,
    pub change_type: ChangeType,
    pub name: Option<String>,
    pub sequence: u64,
}
