//! Throttle for progress persistence.
//!
//! Writing the run record after every item is safe but prohibitively
//! expensive on large collections; writing only at the end loses all
//! progress on a crash. The ticker bounds both: at most one interval's
//! worth of items is ever at risk of re-processing.

use std::time::{Duration, Instant};

/// Decides, per processed item, whether progress should be written now.
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    last_persisted: Instant,
}

impl Ticker {
    /// Create a ticker persisting at most once per `interval`. A zero
    /// interval persists on every item.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_persisted: Instant::now(),
        }
    }

    /// Record one processed item; returns true when the caller should
    /// persist progress now.
    pub fn tick(&mut self) -> bool {
        self.last_persisted.elapsed() >= self.interval
    }

    /// Reset the interval clock after a successful persist.
    pub fn mark_persisted(&mut self) {
        self.last_persisted = Instant::now();
    }
}
