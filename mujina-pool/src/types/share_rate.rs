//! Share cadence as seen by VarDiff.

use std::fmt;
use std::time::Duration;

/// Average spacing between shares on a connection.
///
/// VarDiff compares the spacing it aims for with the spacing it observed
/// over a retarget window. Keeping the interval rather than a count per unit
/// time means the value can never be zero or negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareRate(Duration);

impl ShareRate {
    /// One share every `interval`.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub const fn from_interval(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "interval must be non-zero");
        Self(interval)
    }

    /// Spacing observed when `shares` arrived over `elapsed`.
    ///
    /// A window without shares is treated as if exactly one share arrived at
    /// its end, which yields the slowest spacing the window can express.
    /// Returns `None` for an empty window.
    pub fn observed(shares: u64, elapsed: Duration) -> Option<Self> {
        if elapsed.is_zero() {
            return None;
        }
        Some(Self(elapsed.div_f64(shares.max(1) as f64)))
    }

    /// How much faster this spacing is than `target`.
    ///
    /// Above 1.0 shares arrive too often, below 1.0 too rarely. Multiplying
    /// the current difficulty by this factor moves the spacing onto `target`.
    pub fn speedup_over(&self, target: ShareRate) -> f64 {
        target.0.as_secs_f64() / self.0.as_secs_f64()
    }

    /// Whether the spacing lies within `percent` of `target`'s.
    pub fn within(&self, target: ShareRate, percent: f64) -> bool {
        let target_secs = target.0.as_secs_f64();
        let variance = target_secs * percent / 100.0;
        (self.0.as_secs_f64() - target_secs).abs() <= variance
    }
}

impl fmt::Display for ShareRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1 share/{:.1}s", self.0.as_secs_f64())
    }
}
