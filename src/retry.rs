//! Per-step retry backoff math: `delay = min(base * 2^attempt, max_delay)`.

use std::time::Duration;

/// Governs the sleep between step-execution attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Sleep duration before the next attempt after `attempt` has just
    /// failed (1-based). `delay_for_attempt(1)` is the wait before
    /// attempt 2 begins.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let base = self.base_delay.as_secs_f64() * 2f64.powi(attempt);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(1.0), Duration::from_secs_f64(300.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(Duration::from_secs_f64(1.0), Duration::from_secs_f64(300.0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs_f64(2.0));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs_f64(4.0));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs_f64(8.0));
    }

    #[test]
    fn backoff_respects_max_delay() {
        let policy = RetryPolicy::new(Duration::from_secs_f64(1.0), Duration::from_secs_f64(10.0));
        // 2^10 seconds would vastly exceed the 10s cap.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs_f64(10.0));
    }

    #[test]
    fn backoff_bound_property() {
        let policy = RetryPolicy::default();
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            let bound = (policy.base_delay.as_secs_f64() * 2f64.powi(attempt)).min(policy.max_delay.as_secs_f64());
            assert!(delay.as_secs_f64() <= bound + f64::EPSILON);
        }
    }
}
