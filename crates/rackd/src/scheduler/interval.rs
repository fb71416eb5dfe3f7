//! Randomized re-arm intervals.

use rand::Rng;
use std::time::Duration;

use super::SchedulerError;

/// Bounds for the delay between two ticks of a periodic task.
///
/// Every re-arm draws a fresh delay uniformly from `[min, max]`, so daemons
/// started at the same moment drift apart instead of hitting shared
/// resources together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalRange {
    min: Duration,
    max: Duration,
}

impl IntervalRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self, SchedulerError> {
        if min > max {
            return Err(SchedulerError::InvalidInterval { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn from_secs(min: u64, max: u64) -> Result<Self, SchedulerError> {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    /// Degenerate range without jitter
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min: interval,
            max: interval,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn contains(&self, delay: Duration) -> bool {
        delay >= self.min && delay <= self.max
    }

    /// Draw the next delay, uniform over the closed range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let low = self.min.as_nanos() as u64;
        let high = self.max.as_nanos() as u64;
        Duration::from_nanos(rng.gen_range(low..=high))
    }
}
