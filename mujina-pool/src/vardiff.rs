//! Variable difficulty.
//!
//! Each connection runs its own [`VarDiffController`]. The connection counts
//! accepted shares into it and ticks it on a timer; once per retarget window
//! the controller compares the observed share interval with the target
//! interval and, when they differ by more than the allowed variance, proposes
//! a new difficulty. The proposal becomes the worker's pending difficulty and
//! is applied at the next job boundary, never mid-job.

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::tracing::prelude::*;
use crate::types::ShareRate;

/// Bounds on the multiplicative change of a single retarget.
const MAX_STEP_UP: f64 = 4.0;
const MAX_STEP_DOWN: f64 = 0.25;

/// VarDiff settings for one port.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VarDiffConfig {
    pub min_difficulty: f64,
    pub max_difficulty: Option<f64>,
    /// Desired seconds between shares.
    pub target_time_secs: f64,
    /// Seconds between retarget evaluations.
    pub retarget_time_secs: f64,
    /// Allowed deviation from the target interval, in percent.
    pub variance_percent: f64,
    /// Largest absolute change of a single retarget.
    pub max_delta: Option<f64>,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min_difficulty: 1.0,
            max_difficulty: None,
            target_time_secs: 15.0,
            retarget_time_secs: 90.0,
            variance_percent: 30.0,
            max_delta: None,
        }
    }
}

impl VarDiffConfig {
    pub fn target_rate(&self) -> ShareRate {
        ShareRate::from_interval(Duration::from_secs_f64(self.target_time_secs))
    }

    pub fn retarget_interval(&self) -> Duration {
        Duration::from_secs_f64(self.retarget_time_secs)
    }

    /// Clamp a difficulty into `[min_difficulty, max_difficulty]`.
    pub fn clamp(&self, difficulty: f64) -> f64 {
        let difficulty = difficulty.max(self.min_difficulty);
        match self.max_difficulty {
            Some(max) => difficulty.min(max),
            None => difficulty,
        }
    }
}

/// Retargets one connection's difficulty.
#[derive(Debug)]
pub struct VarDiffController {
    config: VarDiffConfig,
    window_start: Instant,
    shares: u64,
}

impl VarDiffController {
    pub fn new(config: VarDiffConfig, now: Instant) -> Self {
        Self {
            config,
            window_start: now,
            shares: 0,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.config
    }

    /// Count an accepted share into the current window.
    pub fn record_share(&mut self) {
        self.shares += 1;
    }

    /// Evaluate the window if a retarget interval has passed.
    ///
    /// Returns the new difficulty when the observed rate lies outside the
    /// variance band and the damped, clamped result differs from `current`.
    /// The window restarts after every evaluation, whether or not it led to
    /// a change. A window without shares counts as one share at its end, so
    /// idle connections retarget downward.
    pub fn tick(&mut self, now: Instant, current: f64) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.config.retarget_interval() {
            return None;
        }

        let shares = std::mem::take(&mut self.shares);
        self.window_start = now;

        let observed = ShareRate::observed(shares, elapsed)?;
        let target = self.config.target_rate();
        if observed.within(target, self.config.variance_percent) {
            trace!(%observed, %target, "Share rate within variance");
            return None;
        }

        let step = observed
            .speedup_over(target)
            .clamp(MAX_STEP_DOWN, MAX_STEP_UP);
        let mut proposed = current * step;

        if let Some(max_delta) = self.config.max_delta {
            proposed = proposed.clamp(current - max_delta, current + max_delta);
        }
        let proposed = self.config.clamp(proposed);

        if (proposed - current).abs() <= f64::EPSILON * current.abs() {
            return None;
        }

        debug!(
            shares,
            elapsed_secs = elapsed.as_secs_f64(),
            %observed,
            current,
            proposed,
            "VarDiff retarget"
        );
        Some(proposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VarDiffConfig {
        VarDiffConfig {
            min_difficulty: 8.0,
            max_difficulty: Some(100_000.0),
            target_time_secs: 15.0,
            retarget_time_secs: 90.0,
            variance_percent: 30.0,
            max_delta: None,
        }
    }

    fn run_window(config: VarDiffConfig, shares: u64, current: f64) -> Option<f64> {
        let start = Instant::now();
        let mut vardiff = VarDiffController::new(config, start);
        for _ in 0..shares {
            vardiff.record_share();
        }
        vardiff.tick(start + Duration::from_secs(90), current)
    }

    #[test]
    fn test_no_retarget_before_interval() {
        let start = Instant::now();
        let mut vardiff = VarDiffController::new(config(), start);
        for _ in 0..100 {
            vardiff.record_share();
        }
        assert_eq!(vardiff.tick(start + Duration::from_secs(30), 1000.0), None);
    }

    #[test]
    fn test_within_variance_keeps_difficulty() {
        // 6 shares in 90s is exactly one per 15s.
        assert_eq!(run_window(config(), 6, 1000.0), None);
    }

    #[test]
    fn test_fast_shares_raise_difficulty() {
        // 12 shares in 90s: one every 7.5s, twice the target rate.
        let proposed = run_window(config(), 12, 1000.0).unwrap();
        assert!((proposed - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_is_damped() {
        // 90 shares in 90s would call for 15x; a single step is capped at 4x.
        let proposed = run_window(config(), 90, 1000.0).unwrap();
        assert!((proposed - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn test_idle_window_lowers_difficulty() {
        let proposed = run_window(config(), 0, 1000.0).unwrap();
        assert!((proposed - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_clamped_to_bounds() {
        assert_eq!(run_window(config(), 0, 10.0), Some(8.0));
        assert_eq!(run_window(config(), 0, 8.0), None);
        assert_eq!(run_window(config(), 90, 60_000.0), Some(100_000.0));
    }

    #[test]
    fn test_max_delta() {
        let config = VarDiffConfig {
            max_delta: Some(500.0),
            ..config()
        };
        let proposed = run_window(config, 90, 1000.0).unwrap();
        assert!((proposed - 1500.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_restarts_after_evaluation() {
        let start = Instant::now();
        let mut vardiff = VarDiffController::new(config(), start);
        for _ in 0..12 {
            vardiff.record_share();
        }
        assert!(vardiff.tick(start + Duration::from_secs(90), 1000.0).is_some());

        // Next window sees only its own shares.
        for _ in 0..6 {
            vardiff.record_share();
        }
        assert_eq!(vardiff.tick(start + Duration::from_secs(180), 2000.0), None);
    }
}
