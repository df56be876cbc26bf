//! Runtime-aware clock.

use freshet_core::Clock;
use std::time::Instant;

/// Clock that follows the tokio timer.
///
/// Under a paused test runtime it advances together with `tokio::time`,
/// so staleness windows and poll intervals stay in step.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
