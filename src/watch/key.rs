//! Watch key addressing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one shared watch: a connection plus a canonical directory path.
///
/// Two subscribers naming the same directory always produce equal keys, so
/// the path is normalised on construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchKey {
    connection_id: String,
    path: String,
}

impl WatchKey {
    /// Create a key with case-insensitive path matching.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, path: &str) -> Self {
        Self::with_case(connection_id, path, true)
    }

    /// Create a key, folding path case only when `case_insensitive` is set.
    #[must_use]
    pub fn with_case(connection_id: impl Into<String>, path: &str, case_insensitive: bool) -> Self {
        Self {
            connection_id: connection_id.into().trim().to_string(),
            path: normalize_path(path, case_insensitive),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Normalised directory path relative to the share root (empty for the root).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the key addresses the share root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.connection_id, self.path)
    }
}

/// Canonicalise a share-relative directory path.
///
/// Backslashes become `/`, empty and `.` segments are dropped, leading and
/// trailing separators are stripped. `..` is kept verbatim; backends reject it.
#[must_use]
pub fn normalize_path(path: &str, case_insensitive: bool) -> String {
    let joined = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if case_insensitive {
        joined.to_lowercase()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_trailing_and_leading_separators() {
        assert_eq!(normalize_path("/photos/2024/", true), "photos/2024");
        assert_eq!(normalize_path("photos/2024", true), "photos/2024");
    }

    #[test]
    fn test_backslashes_and_duplicates() {
        assert_eq!(normalize_path(r"\photos\\2024\.\raw", true), "photos/2024/raw");
    }

    #[test]
    fn test_root_variants() {
        for root in ["", "/", "\\", "./", "//"] {
            assert_eq!(normalize_path(root, true), "", "input {root:?}");
        }
        assert!(WatchKey::new("c1", "/").is_root());
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(normalize_path("Photos/RAW", true), "photos/raw");
        assert_eq!(normalize_path("Photos/RAW", false), "Photos/RAW");
    }

    #[test]
    fn test_equivalent_paths_share_a_key() {
        let keys: HashSet<WatchKey> = ["/Docs/", "docs", r"\DOCS", "docs/./"]
            .into_iter()
            .map(|p| WatchKey::new("conn", p))
            .collect();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_connection_distinguishes_keys() {
        assert_ne!(WatchKey::new("a", "docs"), WatchKey::new("b", "docs"));
    }

    #[test]
    fn test_display() {
        assert_eq!(WatchKey::new("conn", "a/b").to_string(), "conn:/a/b");
        assert_eq!(WatchKey::new("conn", "").to_string(), "conn:/");
    }
}
