//! Beacon delay schedule.
//!
//! Beacons start fast so that clients notice a (re)started server quickly,
//! then slow down geometrically to the steady period.  The N-th delay after
//! a reset is `min(initial * 2^(N-1), steady)`.

use std::time::Duration;

/// Initial delay between the first two beacons.
pub const INITIAL_BEACON_DELAY: Duration = Duration::from_millis(20);

/// Default steady-state beacon period.
pub const DEFAULT_BEACON_PERIOD: Duration = Duration::from_secs(15);

/// Geometric delay sequence clamped at a steady period.
#[derive(Debug, Clone)]
pub struct BeaconSchedule {
    initial: Duration,
    steady: Duration,
    current: Duration,
}

impl BeaconSchedule {
    /// A schedule from `initial` up to `steady`.  An `initial` above
    /// `steady` is clamped.
    pub fn new(initial: Duration, steady: Duration) -> Self {
        let initial = initial.min(steady);
        Self {
            initial,
            steady,
            current: initial,
        }
    }

    /// A schedule from [`INITIAL_BEACON_DELAY`] up to `steady`.
    pub fn with_period(steady: Duration) -> Self {
        Self::new(INITIAL_BEACON_DELAY, steady)
    }

    /// Returns the delay to sleep now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current < self.steady {
            self.current = self.current.saturating_mul(2).min(self.steady);
        }
        delay
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn steady(&self) -> Duration {
        self.steady
    }
}

impl Default for BeaconSchedule {
    fn default() -> Self {
        Self::with_period(DEFAULT_BEACON_PERIOD)
    }
}
