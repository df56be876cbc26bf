//! FRESHET Core - Cache Data Types
//!
//! Pure data structures shared by the cache engine and its callers.
//! This crate contains no async runtime and performs no I/O beyond
//! reading configuration files.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheSettings, PolicyConfig};
pub use entry::{CacheEntry, EntryState};
pub use error::{BoxError, CacheError, CacheResult, ConfigError};
pub use policy::RevalidationPolicy;

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Opaque cache key chosen by the caller.
///
/// By convention keys are dotted, namespaced names such as
/// `"receipt.summary"` or `"dispatch.list"`. The cache never interprets
/// a key beyond prefix matching for bulk invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key lives under the given namespace prefix.
    ///
    /// A prefix ending in `.` matches any key that starts with it. A prefix
    /// without a trailing dot matches the key itself and any key nested
    /// beneath it, so `"receipt"` matches `"receipt"` and `"receipt.list"`
    /// but not `"receipts"`.
    pub fn in_namespace(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        if prefix.ends_with('.') {
            return self.0.starts_with(prefix);
        }
        match self.0.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }

    /// Iterate the dotted parents of this key, longest first.
    ///
    /// `"a.b.c"` yields `"a.b"` then `"a"`.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        let key = self.0.as_str();
        key.char_indices()
            .rev()
            .filter(|(_, c)| *c == '.')
            .map(move |(idx, _)| &key[..idx])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

/// Load sequence number. Issued from one counter per store, so it is
/// strictly increasing for a given key, including across evictions.
pub type LoadSeq = u64;
