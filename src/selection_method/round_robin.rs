use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared rotation cursor. Every call to [`RoundRobin::next`] consumes exactly
/// one value, so concurrent callers never observe the same position. The
/// counter wraps at `usize::MAX`.
#[derive(Debug, Default)]
pub struct RoundRobin(AtomicUsize);

impl RoundRobin {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Returns the current position and advances the cursor by one.
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of positions consumed so far.
    pub fn position(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
