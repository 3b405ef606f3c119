//! Memoryless timing
//!
//! Waits drawn from an exponential distribution, clamped to a range.
//! Sampling at such instants observes a process without synchronizing
//! with any periodic behavior it may have.

use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Parameters of the wait distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Mean of the unclamped distribution
    pub expected: Duration,
    /// Shortest wait
    pub min: Duration,
    /// Longest wait; zero means unbounded
    pub max: Duration,
}

impl Config {
    /// Verify that `min <= expected <= max`, or `min <= expected` when
    /// `max` is zero.
    pub fn check(&self) -> Result<()> {
        let ordered = self.min <= self.expected
            && (self.max.is_zero() || self.expected <= self.max);
        if !ordered {
            return Err(Error::Memoryless(format!(
                "it should be true that min <= expected <= max (or min <= expected and max is 0), \
                 but that is not true for min({:?}) expected({:?}) max({:?})",
                self.min, self.expected, self.max
            )));
        }
        Ok(())
    }

    /// Draw the next wait
    pub fn wait_time(&self) -> Duration {
        self.wait_time_with(&mut rand::thread_rng())
    }

    /// Draw the next wait from `rng`
    pub fn wait_time_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        // inverse transform sampling of Exp(1)
        let unit: f64 = -(1.0 - rng.gen::<f64>()).ln();
        let wait = Duration::try_from_secs_f64(unit * self.expected.as_secs_f64())
            .unwrap_or(Duration::MAX);
        let wait = wait.max(self.min);
        if self.max.is_zero() {
            wait
        } else {
            wait.min(self.max)
        }
    }
}
