//! Store change notifications.

use freshet_core::{CacheKey, LoadSeq};
use std::sync::Arc;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A load was started for the key.
    LoadStarted,
    /// A new value was committed.
    Committed,
    /// A load failed and `last_error` was recorded.
    Failed,
    /// A load ended through cooperative cancellation.
    Cancelled,
    /// The key was forced stale.
    Invalidated,
    /// The entry was removed.
    Evicted,
}

/// Notification delivered to listeners of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: CacheKey,
    pub kind: EventKind,
    /// Latest load sequence for the key when the event fired.
    pub seq: LoadSeq,
}

pub(crate) type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Registration returned by [`CacheStore::subscribe`](crate::CacheStore::subscribe).
///
/// The listener is removed when the handle is dropped or cancelled.
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub(crate) fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Unregister now.
    pub fn cancel(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
