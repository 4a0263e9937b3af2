//! Circuit breaker for the L2 tier.
//!
//! External failures over a sliding window trip the router into L1-only
//! degraded mode; the breaker closes again after a cool-off.

/// Sliding-window failure breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    window_ms: i64,
    threshold: u32,
    cooloff_ms: i64,
    failures: std::collections::VecDeque<i64>,
    open_until: Option<i64>,
}

impl CircuitBreaker {
    /// Create a breaker tripping at `threshold` failures within `window_ms`,
    /// staying open for `cooloff_ms`.
    #[must_use]
    pub const fn new(window_ms: i64, threshold: u32, cooloff_ms: i64) -> Self {
        Self {
            window_ms,
            threshold,
            cooloff_ms,
            failures: std::collections::VecDeque::new(),
            open_until: None,
        }
    }

    /// Whether calls must be short-circuited at `now_ms`.
    pub fn is_open(&mut self, now_ms: i64) -> bool {
        if let Some(until) = self.open_until {
            if now_ms < until {
                return true;
            }
            // Cool-off elapsed: close and forget the window.
            self.open_until = None;
            self.failures.clear();
        }
        false
    }

    /// Record a successful call; shrinks the failure window.
    pub fn record_success(&mut self) {
        self.failures.clear();
    }

    /// Record a failed call at `now_ms`, possibly tripping the breaker.
    pub fn record_failure(&mut self, now_ms: i64) {
        self.failures.push_back(now_ms);
        while let Some(&oldest) = self.failures.front() {
            if now_ms - oldest > self.window_ms {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.failures.len() >= self.threshold as usize {
            tracing::warn!(
                failures = self.failures.len(),
                cooloff_ms = self.cooloff_ms,
                "L2 circuit breaker tripped"
            );
            self.open_until = Some(now_ms + self.cooloff_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold_within_window() {
        let mut breaker = CircuitBreaker::new(1_000, 3, 5_000);
        breaker.record_failure(0);
        breaker.record_failure(100);
        assert!(!breaker.is_open(150));
        breaker.record_failure(200);
        assert!(breaker.is_open(250));
    }

    #[test]
    fn test_old_failures_age_out() {
        let mut breaker = CircuitBreaker::new(1_000, 3, 5_000);
        breaker.record_failure(0);
        breaker.record_failure(100);
        // The first two are outside the window by the time the third lands.
        breaker.record_failure(2_000);
        assert!(!breaker.is_open(2_001));
    }

    #[test]
    fn test_closes_after_cooloff() {
        let mut breaker = CircuitBreaker::new(1_000, 1, 500);
        breaker.record_failure(0);
        assert!(breaker.is_open(100));
        assert!(!breaker.is_open(600));
    }

    #[test]
    fn test_success_resets_window() {
        let mut breaker = CircuitBreaker::new(1_000, 2, 500);
        breaker.record_failure(0);
        breaker.record_success();
        breaker.record_failure(100);
        assert!(!breaker.is_open(150));
    }
}
