use std::time::Duration;

/// Default delay unit for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);
/// Default number of attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What to do with a job after one more failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to `PENDING`, eligible again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Attempts exhausted: `DEAD` until an administrator resets it.
    Dead { attempts: u32 },
}

impl FailureDecision {
    pub fn attempts(&self) -> u32 {
        match self {
            FailureDecision::Retry { attempts, .. } | FailureDecision::Dead { attempts } => {
                *attempts
            }
        }
    }
}

/// Exponential backoff with a dead-letter cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Decides the outcome of a failure given the attempt count *before*
    /// it. The count is incremented here and nowhere else.
    pub fn decide(&self, previous_attempts: u32, max_attempts: u32) -> FailureDecision {
        let attempts = previous_attempts.saturating_add(1);
        if attempts >= max_attempts {
            FailureDecision::Dead { attempts }
        } else {
            FailureDecision::Retry {
                attempts,
                delay: self.backoff(previous_attempts),
            }
        }
    }

    /// `base_delay * 2^previous_attempts`, saturating instead of overflowing.
    pub fn backoff(&self, previous_attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(previous_attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(2000));
        assert_eq!(policy.backoff(1), Duration::from_millis(4000));
        assert_eq!(policy.backoff(2), Duration::from_millis(8000));
    }

    #[test]
    fn test_three_failures_with_max_three() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, 3),
            FailureDecision::Retry {
                attempts: 1,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(
            policy.decide(1, 3),
            FailureDecision::Retry {
                attempts: 2,
                delay: Duration::from_millis(4000)
            }
        );
        assert_eq!(policy.decide(2, 3), FailureDecision::Dead { attempts: 3 });
    }

    #[test]
    fn test_single_attempt_goes_straight_to_dead() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, 1), FailureDecision::Dead { attempts: 1 });
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.backoff(40), Duration::MAX);
    }
}
