use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Multiplier on `max_calls` for the ramp-up divisor. 1.0 means no burst
/// allowance beyond the configured rate.
const BURST_FACTOR: f64 = 1.0;

/// Paces the dispatch loop so the long-run call rate stays within
/// `max_calls` per `period`. The no-op variant is used when the operator
/// does not set a rate.
///
/// Work between `acquire` and `release` counts as one call. State is only
/// touched from the dispatch loop, so no lock is needed.
pub enum RateLimiter {
    Paced(PacedLimiter),
    Unlimited,
}

impl RateLimiter {
    pub fn paced(max_calls: f64, period_secs: f64) -> Self {
        Self::Paced(PacedLimiter::new(max_calls, period_secs))
    }

    pub fn unlimited() -> Self {
        Self::Unlimited
    }

    /// Sleeps until issuing another call keeps the long-run rate within
    /// budget. A cancelled sleep propagates cancellation to the caller.
    pub async fn acquire(&mut self) {
        match self {
            Self::Paced(limiter) => limiter.acquire().await,
            Self::Unlimited => {}
        }
    }

    /// Records the call timestamp and trims entries that fell out of the
    /// window.
    pub fn release(&mut self) {
        match self {
            Self::Paced(limiter) => limiter.release(),
            Self::Unlimited => {}
        }
    }

    /// The executor's lag warning only makes sense when a rate is set.
    pub fn is_paced(&self) -> bool {
        matches!(self, Self::Paced(_))
    }
}

/// Linear rate estimator over a queue of recent call timestamps.
pub struct PacedLimiter {
    calls: VecDeque<Instant>,
    period: f64,
    max_calls: f64,
}

impl PacedLimiter {
    pub fn new(max_calls: f64, period_secs: f64) -> Self {
        Self {
            calls: VecDeque::new(),
            period: period_secs,
            max_calls,
        }
    }

    async fn acquire(&mut self) {
        let len = self.calls.len() as f64;
        let sleep_time = if len >= self.max_calls {
            self.period - self.timespan()
        } else if self.calls.len() > 1 {
            // Smoothly spaced ramp-up instead of a burst at the start.
            (self.period - self.timespan())
                / ((self.max_calls * BURST_FACTOR).ceil() - len)
        } else {
            0.0
        };

        if sleep_time > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(sleep_time)).await;
        }
    }

    fn release(&mut self) {
        self.calls.push_back(Instant::now());
        while self.timespan() >= self.period {
            self.calls.pop_front();
        }
    }

    /// Seconds between the oldest and newest recorded call, 0 with fewer
    /// than two entries.
    fn timespan(&self) -> f64 {
        match (self.calls.front(), self.calls.back()) {
            (Some(first), Some(last)) => last.duration_since(*first).as_secs_f64(),
            _ => 0.0,
        }
    }
}
