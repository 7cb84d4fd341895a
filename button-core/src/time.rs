//! Monotonic time abstraction shared by every state machine in the crate.

use core::{ops::Add, time::Duration};

/// Monotonic instant supplied by the executor (firmware) or a simulated clock.
pub trait Timestamp: Copy + Ord + Add<Duration, Output = Self> {
    /// Returns the time elapsed since `earlier`, or zero if `earlier` is later.
    fn saturating_duration_since(&self, earlier: Self) -> Duration;

    /// Returns `true` once at least `window` has passed since `start`.
    fn has_elapsed(&self, start: Self, window: Duration) -> bool {
        self.saturating_duration_since(start) >= window
    }
}
