use std::time::{Duration, SystemTime};

/// Controls whether and how failed attempts of an activity are retried.
///
/// `maximum_attempts == 0` means unlimited attempts. The expiration interval
/// is an absolute budget measured from the *first* scheduling of the
/// activity; retries never extend it.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Backoff before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the backoff for each subsequent retry. Must be
    /// at least 1.
    pub backoff_coefficient: f64,
    /// Cap on the computed backoff. Defaults to 100x the initial interval.
    pub maximum_interval: Option<Duration>,
    /// Total number of attempts allowed, counting the first one. 0 = unlimited.
    pub maximum_attempts: u32,
    /// Absolute retry budget from first scheduling.
    pub expiration_interval: Option<Duration>,
    /// Failure reasons which are never retried, matched case-insensitively.
    pub non_retriable_error_reasons: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 0,
            expiration_interval: None,
            non_retriable_error_reasons: vec![],
        }
    }
}

/// Why a failed attempt will not be retried.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoRetry {
    /// The activity was scheduled without a retry policy.
    #[error("no retry policy configured")]
    NoPolicy,
    /// The failure reason matched the policy's non-retriable set.
    #[error("failure reason is non-retriable")]
    NonRetriable,
    /// The policy's attempt budget is exhausted.
    #[error("maximum attempts reached")]
    MaxAttemptsReached,
    /// Waiting out the next backoff would cross the expiration deadline fixed
    /// at first scheduling.
    #[error("next retry would exceed the expiration deadline")]
    ExpiredBudget,
}

/// Ask the retry policy whether the just-failed attempt should be retried.
/// `attempt` is the 1-based number of the attempt that failed.
///
/// Returns the backoff to wait before the next attempt, or the reason no
/// retry will happen. Pure: identical inputs always produce identical
/// verdicts, for worker-reported failures and timeouts alike.
pub(crate) fn should_retry(
    policy: Option<&RetryPolicy>,
    attempt: u32,
    failure_reason: &str,
    now: SystemTime,
    expiration_deadline: Option<SystemTime>,
) -> Result<Duration, NoRetry> {
    let policy = policy.ok_or(NoRetry::NoPolicy)?;
    if policy
        .non_retriable_error_reasons
        .iter()
        .any(|r| r.eq_ignore_ascii_case(failure_reason))
    {
        return Err(NoRetry::NonRetriable);
    }
    if policy.maximum_attempts > 0 && attempt >= policy.maximum_attempts {
        return Err(NoRetry::MaxAttemptsReached);
    }
    let delay = backoff_interval(policy, attempt);
    if let Some(deadline) = expiration_deadline {
        // The budget is never extended, so a retry that could not finish
        // arriving before the deadline is pointless.
        if now.checked_add(delay).map_or(true, |then| then >= deadline) {
            return Err(NoRetry::ExpiredBudget);
        }
    }
    Ok(delay)
}

/// `min(initial * coeff^(attempt - 1), maximum_interval)`, saturating at the
/// maximum when the product overflows what a `Duration` can hold.
fn backoff_interval(policy: &RetryPolicy, attempt: u32) -> Duration {
    let max_interval = policy
        .maximum_interval
        .unwrap_or_else(|| policy.initial_interval.saturating_mul(100));
    if attempt <= 1 {
        return policy.initial_interval.min(max_interval);
    }
    let mul_factor = policy.backoff_coefficient.powi(attempt as i32 - 1);
    try_from_secs_f64(mul_factor * policy.initial_interval.as_secs_f64())
        .unwrap_or(max_interval)
        .min(max_interval)
}

const NANOS_PER_SEC: u32 = 1_000_000_000;
/// modified from rust stdlib since this feature is currently nightly only
fn try_from_secs_f64(secs: f64) -> Option<Duration> {
    const MAX_NANOS_F64: f64 = ((u64::MAX as u128 + 1) * (NANOS_PER_SEC as u128)) as f64;
    let nanos = secs * (NANOS_PER_SEC as f64);
    if !nanos.is_finite() || !(0.0..MAX_NANOS_F64).contains(&nanos) {
        None
    } else {
        Some(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(10)),
            maximum_attempts: 10,
            expiration_interval: None,
            non_retriable_error_reasons: vec![],
        }
    }

    #[test]
    fn calcs_backoffs_properly() {
        let rp = policy();
        let now = SystemTime::now();
        for (attempt, expected_ms) in [(1, 1_000), (2, 2_000), (3, 4_000), (4, 8_000), (5, 10_000)]
        {
            let res = should_retry(Some(&rp), attempt, "boom", now, None).unwrap();
            assert_eq!(res.as_millis(), expected_ms, "attempt {}", attempt);
        }
        // Max attempts - no retry
        assert_eq!(
            should_retry(Some(&rp), 10, "boom", now, None),
            Err(NoRetry::MaxAttemptsReached)
        );
    }

    #[test]
    fn no_policy_never_retries() {
        assert_eq!(
            should_retry(None, 1, "boom", SystemTime::now(), None),
            Err(NoRetry::NoPolicy)
        );
    }

    #[test]
    fn max_attempts_zero_retry_forever() {
        let rp = RetryPolicy {
            maximum_attempts: 0,
            backoff_coefficient: 1.2,
            ..policy()
        };
        let now = SystemTime::now();
        for i in 1..50 {
            assert!(should_retry(Some(&rp), i, "boom", now, None).is_ok());
        }
    }

    #[test]
    fn no_overflows() {
        let rp = RetryPolicy {
            backoff_coefficient: 10.0,
            maximum_interval: None,
            maximum_attempts: 0,
            ..policy()
        };
        let now = SystemTime::now();
        for i in 1..50 {
            assert!(should_retry(Some(&rp), i, "boom", now, None).is_ok());
        }
    }

    #[test]
    fn no_retry_err_str_match() {
        let rp = RetryPolicy {
            non_retriable_error_reasons: vec!["bad-bug".to_string()],
            ..policy()
        };
        let now = SystemTime::now();
        assert_eq!(
            should_retry(Some(&rp), 1, "bad-bug", now, None),
            Err(NoRetry::NonRetriable)
        );
        // Match is case-insensitive, other reasons still retry
        assert_eq!(
            should_retry(Some(&rp), 1, "BAD-BUG", now, None),
            Err(NoRetry::NonRetriable)
        );
        assert!(should_retry(Some(&rp), 1, "bad-luck-please-retry", now, None).is_ok());
    }

    #[test]
    fn expiration_budget_is_enforced() {
        let rp = RetryPolicy {
            backoff_coefficient: 1.0,
            ..policy()
        };
        let now = SystemTime::now();
        let deadline = now + Duration::from_secs(100);
        assert!(should_retry(Some(&rp), 1, "boom", now, Some(deadline)).is_ok());
        // A backoff landing on or past the deadline is refused
        let late = deadline - Duration::from_millis(500);
        assert_eq!(
            should_retry(Some(&rp), 1, "boom", late, Some(deadline)),
            Err(NoRetry::ExpiredBudget)
        );
        assert_eq!(
            should_retry(Some(&rp), 1, "boom", deadline, Some(deadline)),
            Err(NoRetry::ExpiredBudget)
        );
    }
}
