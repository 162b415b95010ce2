//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the session orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Shortest period a loop may be configured with.
const MIN_PERIOD: Duration = Duration::from_micros(100);

/// Convert a rate in hertz into a loop period.
///
/// Non-finite or non-positive rates fall back to one second.
pub fn period_from_hz(hz: f64) -> Duration {
    if !hz.is_finite() || hz <= 0.0 {
        return Duration::from_secs(1);
    }
    Duration::from_secs_f64(1.0 / hz).max(MIN_PERIOD)
}

/// Simple async rate limiter that ensures deterministic loop intervals.
///
/// Missed ticks are skipped, so a stalled loop resumes on the original grid
/// instead of bursting to catch up.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let period = period.max(MIN_PERIOD);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { period, interval }
    }

    pub fn from_hz(hz: f64) -> Self {
        Self::new(period_from_hz(hz))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}
