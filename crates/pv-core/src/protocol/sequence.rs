//! Thread-safe wrapping counter for beacon numbering.
//!
//! # Why a wrapping `u32`? (for beginners)
//!
//! Each beacon carries a 32-bit counter in its `cid` slot.  Receivers use the
//! gaps between consecutive values to notice lost beacons and to detect a
//! server restart (the counter jumps back to a small value).  After about
//! four billion beacons the counter wraps to 0; receivers expect this, so
//! the counter must wrap rather than saturate or panic.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU32` internally, so the beacon task and a
//! diagnostic reader can share it without a lock.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe counter that wraps from `u32::MAX` to 0.
///
/// # Examples
///
/// ```rust
/// use pv_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
pub struct SequenceCounter {
    inner: AtomicU32,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first value is `start`.
    pub fn starting_at(start: u32) -> Self {
        Self {
            inner: AtomicU32::new(start),
        }
    }

    /// Returns the next value and advances the counter.
    ///
    /// `Ordering::Relaxed` is sufficient: the value orders beacons, it does
    /// not publish memory to other threads.
    pub fn next(&self) -> u32 {
        // `fetch_add` wraps on overflow.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) will yield.
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
