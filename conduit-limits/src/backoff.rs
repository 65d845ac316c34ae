// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The backoff module defines the [RateLimiter] that spaces out resource creation attempts after
//! consecutive failures.

use std::time::{Duration, Instant};

/// The floor of the default first step when backing off from a zero interval.
const MIN_INITIAL_STEP: Duration = Duration::from_millis(10);

/// Exponential backoff for the creation attempts of one pool.
///
/// The interval starts at `min_interval`. Every failure doubles it up to `max_interval`, a
/// success drops it back to `min_interval`. A new attempt is permitted once the time since the
/// previous attempt reaches the current interval.
///
/// Doubling zero goes nowhere, so when the interval is zero the first failure jumps to
/// `initial_step` instead.
///
/// The limiter is not synchronized: it is meant to live inside the state its owner already
/// guards with a lock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    max_interval: Duration,
    initial_step: Duration,
    current_interval: Duration,
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
}

impl RateLimiter {
    /// Create a new [RateLimiter] bounded to `[min_interval, max_interval]`.
    ///
    /// The initial step defaults to `max(10ms, max_interval / 32)`.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        let max_interval = max_interval.max(min_interval);
        let initial_step = (max_interval / 32).max(MIN_INITIAL_STEP);
        RateLimiter {
            min_interval,
            max_interval,
            initial_step: initial_step.clamp(min_interval, max_interval),
            current_interval: min_interval,
            consecutive_failures: 0,
            last_attempt: None,
        }
    }

    /// Override the step taken by the first failure when the interval is zero.
    pub fn with_initial_step(mut self, step: Duration) -> Self {
        self.initial_step = step.clamp(self.min_interval, self.max_interval);
        self
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether an attempt started at `now` is allowed.
    pub fn permits_at(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) => now.saturating_duration_since(last) >= self.current_interval,
            None => true,
        }
    }

    /// The earliest instant the next attempt is permitted, `None` when no attempt was made yet.
    pub fn next_permit_at(&self) -> Option<Instant> {
        self.last_attempt.map(|last| last + self.current_interval)
    }

    /// Record an attempt at `now` if one is permitted. Return whether it was.
    pub fn try_attempt_at(&mut self, now: Instant) -> bool {
        if !self.permits_at(now) {
            return false;
        }
        self.last_attempt = Some(now);
        true
    }

    pub fn try_attempt(&mut self) -> bool {
        self.try_attempt_at(Instant::now())
    }

    /// An attempt failed, widen the interval.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let next = if self.current_interval.is_zero() {
            self.initial_step
        } else {
            self.current_interval.saturating_mul(2)
        };
        self.current_interval = next.min(self.max_interval);
    }

    /// An attempt succeeded, the destination is healthy again.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_interval = self.min_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_interval_grows_to_max_then_resets() {
        let mut limiter = RateLimiter::new(20 * MS, 500 * MS);
        assert_eq!(limiter.current_interval(), 20 * MS);

        let mut previous = limiter.current_interval();
        for _ in 0..10 {
            limiter.record_failure();
            assert!(limiter.current_interval() >= previous);
            assert!(limiter.current_interval() <= 500 * MS);
            previous = limiter.current_interval();
        }
        assert_eq!(limiter.current_interval(), 500 * MS);
        assert_eq!(limiter.consecutive_failures(), 10);

        limiter.record_success();
        assert_eq!(limiter.current_interval(), 20 * MS);
        assert_eq!(limiter.consecutive_failures(), 0);
    }

    #[test]
    fn test_zero_min_uses_initial_step() {
        // max(10ms, 500ms / 32) = 15.625ms
        let mut limiter = RateLimiter::new(Duration::ZERO, 500 * MS);
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), Duration::from_micros(15_625));
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), Duration::from_micros(31_250));

        let mut limiter = RateLimiter::new(Duration::ZERO, 100 * MS);
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), 10 * MS);

        let mut limiter = RateLimiter::new(Duration::ZERO, 100 * MS).with_initial_step(40 * MS);
        limiter.record_failure();
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), 80 * MS);
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), 100 * MS);
    }

    #[test]
    fn test_initial_step_never_exceeds_max() {
        let mut limiter = RateLimiter::new(Duration::ZERO, 4 * MS);
        limiter.record_failure();
        assert_eq!(limiter.current_interval(), 4 * MS);
    }

    #[test]
    fn test_attempt_spacing() {
        let mut limiter = RateLimiter::new(Duration::ZERO, 1000 * MS).with_initial_step(100 * MS);
        let start = Instant::now();

        // a healthy destination never waits
        assert!(limiter.try_attempt_at(start));
        assert!(limiter.try_attempt_at(start));
        assert_eq!(limiter.next_permit_at(), Some(start));

        limiter.record_failure();
        assert!(!limiter.permits_at(start + 99 * MS));
        assert!(!limiter.try_attempt_at(start + 99 * MS));
        assert_eq!(limiter.next_permit_at(), Some(start + 100 * MS));
        assert!(limiter.try_attempt_at(start + 100 * MS));

        limiter.record_failure();
        assert!(!limiter.permits_at(start + 299 * MS));
        assert!(limiter.permits_at(start + 300 * MS));

        limiter.record_success();
        assert!(limiter.permits_at(start + 100 * MS));
    }

    #[test]
    fn test_interval_stays_in_bounds() {
        let mut rng = rand::thread_rng();
        let mut limiter = RateLimiter::new(5 * MS, 300 * MS);
        for _ in 0..1000 {
            if rng.gen_bool(0.7) {
                limiter.record_failure();
            } else {
                limiter.record_success();
            }
            let interval = limiter.current_interval();
            assert!(interval >= 5 * MS && interval <= 300 * MS, "{interval:?}");
        }
    }
}
