//! Loader contract.
//!
//! A loader is any async function producing the value for a key. The cache
//! treats the value as opaque and the loader owns its own request timeout;
//! a timeout is just another error.

use async_trait::async_trait;
use freshet_core::{BoxError, CacheKey, LoadSeq};
use std::future::Future;
use tokio::sync::watch;

/// Produces the value for a cache key.
#[async_trait]
pub trait Loader<V>: Send + Sync {
    /// Load the value. `ctx` carries an optional cancellation signal.
    async fn load(&self, ctx: LoadContext) -> Result<V, BoxError>;
}

/// Per-load context handed to a [`Loader`].
#[derive(Debug, Clone)]
pub struct LoadContext {
    key: CacheKey,
    seq: LoadSeq,
    cancel: watch::Receiver<bool>,
}

impl LoadContext {
    pub(crate) fn new(key: CacheKey, seq: LoadSeq, cancel: watch::Receiver<bool>) -> Self {
        Self { key, seq, cancel }
    }

    /// A context that is never cancelled.
    pub fn detached(key: impl Into<CacheKey>) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            key: key.into(),
            seq: 0,
            cancel,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn seq(&self) -> LoadSeq {
        self.seq
    }

    /// Whether every subscriber of the key has gone away.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the load is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Adapter turning an async closure into a [`Loader`].
pub struct FnLoader<F> {
    f: F,
}

/// Build a loader from an async closure.
///
/// ```ignore
/// let loader = loader_fn(|_ctx| async move { api.receipt_summary().await.map_err(Into::into) });
/// ```
pub fn loader_fn<V, F, Fut>(f: F) -> FnLoader<F>
where
    F: Fn(LoadContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, BoxError>> + Send,
{
    FnLoader { f }
}

#[async_trait]
impl<V, F, Fut> Loader<V> for FnLoader<F>
where
    V: Send + 'static,
    F: Fn(LoadContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, BoxError>> + Send,
{
    async fn load(&self, ctx: LoadContext) -> Result<V, BoxError> {
        (self.f)(ctx).await
    }
}
