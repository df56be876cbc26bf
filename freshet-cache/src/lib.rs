//! FRESHET Cache - Revalidating data cache
//!
//! Serves cached values while they are fresh, refreshes them in the
//! background once stale, and coalesces concurrent refresh triggers into a
//! single load per key.
//!
//! ```ignore
//! use freshet_cache::{loader_fn, NoopLifecycle, QueryClient, RevalidationPolicy};
//!
//! let client = QueryClient::new(Arc::new(NoopLifecycle));
//! let loader = Arc::new(loader_fn(|_ctx| async move { api.dispatch_list().await }));
//! let mut sub = client.subscribe("dispatch.list", loader, RevalidationPolicy::live_list());
//! let state = sub.wait_for(|s| s.data.is_some()).await;
//! ```

pub mod binding;
pub mod clock;
pub mod coordinator;
pub mod events;
pub mod invalidation;
pub mod lifecycle;
pub mod loader;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use binding::{QueryClient, QueryState, Subscription};
pub use clock::TokioClock;
pub use coordinator::{Fetch, FetchCoordinator, FetchOptions};
pub use events::{CacheEvent, EventKind, ListenerHandle};
pub use invalidation::{Invalidate, Invalidator};
pub use lifecycle::{
    LifecycleCallback, LifecycleEventSource, LifecycleListener, ManualLifecycle, NoopLifecycle,
};
pub use loader::{loader_fn, FnLoader, LoadContext, Loader};
pub use scheduler::{RevalidationScheduler, ScheduleHandle, SchedulerMetricsSnapshot};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use store::{CacheStore, CommitOutcome, InFlightClaim, InFlightWaiter, LoadTicket};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

#[cfg(unix)]
pub use lifecycle::SignalLifecycle;
#[cfg(feature = "terminal")]
pub use lifecycle::TerminalLifecycle;

pub use freshet_core::{
    BoxError, CacheEntry, CacheError, CacheKey, CacheResult, Clock, EntryState, LoadSeq,
    ManualClock, RevalidationPolicy, SystemClock,
};
