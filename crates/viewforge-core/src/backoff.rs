//! Truncated-binary exponential backoff with automatic reset.

use std::time::Duration;

use rand::RngCore;

/// Number of consecutive retries after which the backoff resets to its floor.
pub const CEILING: u32 = 10;

/// Observable state of a [`Backoff`] controller, as handed back from [`Backoff::next`]
/// and stored by the dispatcher keyed by worker id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Base unit the wait is sampled from.
    pub slot: Duration,
    /// Floor added to every computed wait.
    pub constant_delay: Duration,
    /// Retries since the last reset.
    pub retries: u32,
    /// Number of times the ceiling has been hit and the state reset.
    pub resets: u32,
    /// Retries across the controller's whole lifetime, including resets.
    pub total_retries: u64,
    /// The wait duration computed by the most recent call to [`Backoff::next`].
    pub current_wait: Duration,
}

/// A pure value object tracking retry count and yielding the next wait duration.
///
/// Holds no clock; the only external input is an injected RNG, so production
/// code can use the thread-local generator and tests a seeded one.
pub struct Backoff {
    slot: Duration,
    constant_delay: Duration,
    retries: u32,
    resets: u32,
    total_retries: u64,
    current_wait: Duration,
}

impl Backoff {
    /// Construct a fresh controller. `current_wait` starts at `constant_delay`
    /// since no wait has been sampled yet.
    pub fn new(slot: Duration, constant_delay: Duration) -> Self {
        Self {
            slot,
            constant_delay,
            retries: 0,
            resets: 0,
            total_retries: 0,
            current_wait: constant_delay,
        }
    }

    /// Advance the controller by one retry and return the resulting state.
    ///
    /// If `retries < CEILING` this samples a wait uniformly from
    /// `[0, 2^retries' - 1]` slots plus the constant delay. Once the ceiling
    /// is hit, the controller resets: `resets` increments, `retries` goes
    /// back to zero, and `current_wait` drops back to `constant_delay`.
    pub fn next(&mut self, rng: &mut dyn RngCore) -> BackoffState {
        if self.retries < CEILING {
            self.retries += 1;
            let span = 1u64 << self.retries;
            let k = rng.next_u64() % span;
            self.current_wait = self.constant_delay + self.slot * k as u32;
        } else {
            self.resets += 1;
            self.retries = 0;
            self.current_wait = self.constant_delay;
        }
        self.total_retries += 1;
        self.state()
    }

    /// Snapshot the controller's current state without advancing it.
    pub fn state(&self) -> BackoffState {
        BackoffState {
            slot: self.slot,
            constant_delay: self.constant_delay,
            retries: self.retries,
            resets: self.resets,
            total_retries: self.total_retries,
            current_wait: self.current_wait,
        }
    }
}
