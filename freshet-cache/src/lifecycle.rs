//! Foreground/background notifications.
//!
//! The scheduler revalidates every subscribed key when the host comes back
//! to the foreground, and pauses polling while it is in the background.
//! Hosts report those transitions through a [`LifecycleEventSource`].

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Callback invoked on a lifecycle transition.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Source of foreground/background transitions.
pub trait LifecycleEventSource: Send + Sync {
    /// Call `callback` whenever the host returns to the foreground.
    fn on_foreground(&self, callback: LifecycleCallback) -> LifecycleListener;

    /// Call `callback` whenever the host moves to the background.
    fn on_background(&self, callback: LifecycleCallback) -> LifecycleListener;
}

/// Registration guard. Unregisters the callback when dropped.
#[must_use = "dropping the listener unregisters the callback"]
pub struct LifecycleListener {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LifecycleListener {
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// A listener with nothing to release.
    pub fn noop() -> Self {
        Self { detach: None }
    }
}

impl Drop for LifecycleListener {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for LifecycleListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleListener").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Foreground,
    Background,
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    registered: Vec<(u64, Phase, LifecycleCallback)>,
}

/// Lifecycle source driven by explicit calls.
///
/// Suits tests and embedding hosts that run their own event loop.
#[derive(Clone, Default)]
pub struct ManualLifecycle {
    callbacks: Arc<Mutex<Callbacks>>,
}

impl ManualLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_foreground(&self) {
        self.emit(Phase::Foreground);
    }

    pub fn emit_background(&self) {
        self.emit(Phase::Background);
    }

    /// Number of registered callbacks across both phases.
    pub fn listener_count(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registered
            .len()
    }

    fn emit(&self, phase: Phase) {
        let targets: Vec<LifecycleCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .registered
            .iter()
            .filter(|(_, p, _)| *p == phase)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();
        debug!(?phase, listeners = targets.len(), "Lifecycle transition");
        for callback in targets {
            callback();
        }
    }

    fn register(&self, phase: Phase, callback: LifecycleCallback) -> LifecycleListener {
        let id = {
            let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
            callbacks.next_id += 1;
            let id = callbacks.next_id;
            callbacks.registered.push((id, phase, callback));
            id
        };
        let weak = Arc::downgrade(&self.callbacks);
        LifecycleListener::new(move || {
            if let Some(callbacks) = weak.upgrade() {
                callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .registered
                    .retain(|(existing, _, _)| *existing != id);
            }
        })
    }
}

impl LifecycleEventSource for ManualLifecycle {
    fn on_foreground(&self, callback: LifecycleCallback) -> LifecycleListener {
        self.register(Phase::Foreground, callback)
    }

    fn on_background(&self, callback: LifecycleCallback) -> LifecycleListener {
        self.register(Phase::Background, callback)
    }
}

impl std::fmt::Debug for ManualLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualLifecycle")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Lifecycle source that never fires. For server-side use.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl LifecycleEventSource for NoopLifecycle {
    fn on_foreground(&self, _callback: LifecycleCallback) -> LifecycleListener {
        LifecycleListener::noop()
    }

    fn on_background(&self, _callback: LifecycleCallback) -> LifecycleListener {
        LifecycleListener::noop()
    }
}

#[cfg(unix)]
pub use signal::SignalLifecycle;

#[cfg(unix)]
mod signal {
    use super::{LifecycleCallback, LifecycleEventSource, LifecycleListener};
    use tokio::runtime::Handle;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{debug, warn};

    /// Reports `SIGCONT` (resumed after a job-control stop) as foreground.
    ///
    /// Stopping is not observable without overriding the default stop
    /// action, so background is never reported.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SignalLifecycle;

    impl LifecycleEventSource for SignalLifecycle {
        fn on_foreground(&self, callback: LifecycleCallback) -> LifecycleListener {
            let Ok(runtime) = Handle::try_current() else {
                warn!("SIGCONT listener requires a tokio runtime");
                return LifecycleListener::noop();
            };
            let task = runtime.spawn(async move {
                let mut resumed = match signal(SignalKind::from_raw(libc::SIGCONT)) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to install SIGCONT handler");
                        return;
                    }
                };
                while resumed.recv().await.is_some() {
                    debug!("Process resumed");
                    callback();
                }
            });
            LifecycleListener::new(move || task.abort())
        }

        fn on_background(&self, _callback: LifecycleCallback) -> LifecycleListener {
            LifecycleListener::noop()
        }
    }
}

#[cfg(feature = "terminal")]
pub use terminal::TerminalLifecycle;

#[cfg(feature = "terminal")]
mod terminal {
    use super::{LifecycleCallback, LifecycleEventSource, LifecycleListener, ManualLifecycle};
    use crossterm::event::Event;

    /// Maps terminal focus reports to lifecycle transitions.
    ///
    /// The host owns the crossterm event loop (with focus change reporting
    /// enabled) and forwards each event to [`handle_event`](Self::handle_event).
    #[derive(Debug, Clone, Default)]
    pub struct TerminalLifecycle {
        emitter: ManualLifecycle,
    }

    impl TerminalLifecycle {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns true if the event was a focus change.
        pub fn handle_event(&self, event: &Event) -> bool {
            match event {
                Event::FocusGained => {
                    self.emitter.emit_foreground();
                    true
                }
                Event::FocusLost => {
                    self.emitter.emit_background();
                    true
                }
                _ => false,
            }
        }
    }

    impl LifecycleEventSource for TerminalLifecycle {
        fn on_foreground(&self, callback: LifecycleCallback) -> LifecycleListener {
            self.emitter.on_foreground(callback)
        }

        fn on_background(&self, callback: LifecycleCallback) -> LifecycleListener {
            self.emitter.on_background(callback)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        #[test]
        fn test_focus_events_map_to_phases() {
            let lifecycle = TerminalLifecycle::new();
            let gained = Arc::new(AtomicUsize::new(0));
            let _fg = lifecycle.on_foreground({
                let gained = Arc::clone(&gained);
                Arc::new(move || {
                    gained.fetch_add(1, Ordering::SeqCst);
                })
            });

            assert!(lifecycle.handle_event(&Event::FocusGained));
            assert!(lifecycle.handle_event(&Event::FocusLost));
            let key = Event::Key(KeyEvent::new(KeyCode::Char('r'), KeyModifiers::NONE));
            assert!(!lifecycle.handle_event(&key));
            assert_eq!(gained.load(Ordering::SeqCst), 1);
        }
    }
}
