//! Backoff and retry budgets shared by every polling loop.
//!
//! - [`Backoff`]: how long to wait before the next attempt
//! - [`RetryPolicy`]: backoff plus an optional attempt cap and deadline
//! - [`RetryBudget`]: per-loop bookkeeping of a policy
//! - [`sleep`]: a cancellable backoff sleep
//! - [`retry`]: runs a fallible async operation under a policy
//!
//! A policy without `max_attempts` and without `deadline_secs` retries
//! forever; callers still stop on cancellation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Classify;

/// Default base delay for exponential backoff in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default cap for exponential backoff in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;
/// Default number of attempts for bounded policies.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every time.
    Fixed { delay_ms: u64 },
    /// Uniformly random delay in `[min_ms, max_ms]`.
    Jittered { min_ms: u64, max_ms: u64 },
    /// `min(max_ms, base_ms * 2^attempt)` varied by ±`jitter`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default = "default_jitter")]
        jitter: f64,
    },
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: DEFAULT_BASE_DELAY_MS,
            max_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Jittered { min_ms, max_ms } => {
                if max_ms <= min_ms {
                    min_ms
                } else {
                    rand::rng().random_range(min_ms..=max_ms)
                }
            }
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => exponential_delay_ms(attempt, base_ms, max_ms, jitter, rand::rng().random()),
        };
        Duration::from_millis(ms)
    }

    /// Checks the parameters, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Backoff::Fixed { .. } => Ok(()),
            Backoff::Jittered { min_ms, max_ms } if min_ms > max_ms => Err(format!(
                "jittered backoff min_ms ({}) exceeds max_ms ({})",
                min_ms, max_ms
            )),
            Backoff::Jittered { .. } => Ok(()),
            Backoff::Exponential { jitter, .. } if !(0.0..=1.0).contains(&jitter) => Err(
                format!("exponential backoff jitter must be within 0.0..=1.0, got {}", jitter),
            ),
            Backoff::Exponential { base_ms, max_ms, .. } if base_ms > max_ms => Err(format!(
                "exponential backoff base_ms ({}) exceeds max_ms ({})",
                base_ms, max_ms
            )),
            Backoff::Exponential { .. } => Ok(()),
        }
    }
}

/// Exponential backoff with jitter.
///
/// `random` is a value in `[0.0, 1.0)`; it maps to a factor in
/// `[1 - jitter, 1 + jitter)` applied to the capped exponential delay.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn exponential_delay_ms(
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    jitter: f64,
    random: f64,
) -> u64 {
    let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_ms);
    let factor = 1.0 + (random * 2.0 - 1.0) * jitter;
    ((capped as f64) * factor).round().max(0.0) as u64
}

/// Backoff plus the limits that end a retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. `None` means unbounded.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the first attempt. `None` means unbounded.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            deadline_secs: None,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Retries forever with a uniformly random delay in `[min, max]`.
    pub fn unbounded_jittered(min: Duration, max: Duration) -> Self {
        Self {
            max_attempts: None,
            deadline_secs: None,
            backoff: Backoff::Jittered {
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            },
        }
    }

    /// Fixed delay with an attempt cap. Mostly useful in tests.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            deadline_secs: None,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none() && self.deadline_secs.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        self.backoff.validate()
    }
}

/// Attempt and deadline bookkeeping for one retry loop.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
    started: Instant,
}

impl RetryBudget {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            policy: policy.clone(),
            failures: 0,
            started: Instant::now(),
        }
    }

    /// Number of failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forgets recorded failures and restarts the deadline clock.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.started = Instant::now();
    }

    /// Records a failed attempt. Returns the delay before the next attempt,
    /// or `None` once the attempt cap or the deadline is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;

        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                return None;
            }
        }

        let delay = self.policy.backoff.delay(self.failures - 1);

        if let Some(deadline) = self.policy.deadline_secs {
            let budget = Duration::from_secs(deadline);
            if self.started.elapsed() + delay > budget {
                return None;
            }
        }

        Some(delay)
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
pub async fn sleep(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Why [`retry`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Permanent(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("operation cancelled")]
    Cancelled,
}

/// Runs `op` until it succeeds, fails permanently, or the policy runs out.
///
/// `op` receives the zero-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let mut budget = RetryBudget::new(policy);

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let attempt = budget.failures();
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
            Err(e) => match budget.next_delay() {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}): {}; retrying in {:?}",
                        operation,
                        attempt + 1,
                        e,
                        delay
                    );
                    if sleep(delay, cancel).await.is_err() {
                        return Err(RetryError::Cancelled);
                    }
                }
                None => {
                    return Err(RetryError::Exhausted {
                        attempts: budget.failures(),
                        last: e,
                    })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        assert_eq!(exponential_delay_ms(0, 100, 10_000, 0.0, 0.5), 100);
        assert_eq!(exponential_delay_ms(1, 100, 10_000, 0.0, 0.5), 200);
        assert_eq!(exponential_delay_ms(3, 100, 10_000, 0.0, 0.5), 800);
        assert_eq!(exponential_delay_ms(20, 100, 10_000, 0.0, 0.5), 10_000);
    }

    #[test]
    fn test_exponential_delay_jitter_range() {
        // random 0.0 → factor 0.8, random ~1.0 → factor ~1.2
        assert_eq!(exponential_delay_ms(0, 1000, 10_000, 0.2, 0.0), 800);
        assert_eq!(exponential_delay_ms(0, 1000, 10_000, 0.2, 0.5), 1000);
        assert!(exponential_delay_ms(0, 1000, 10_000, 0.2, 0.999) <= 1200);
    }

    #[test]
    fn test_jittered_backoff_stays_in_range() {
        let backoff = Backoff::Jittered {
            min_ms: 50,
            max_ms: 80,
        };
        for attempt in 0..100 {
            let d = backoff.delay(attempt);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(80));
        }
    }

    #[test]
    fn test_jittered_backoff_degenerate_range() {
        let backoff = Backoff::Jittered {
            min_ms: 70,
            max_ms: 70,
        };
        assert_eq!(backoff.delay(3), Duration::from_millis(70));
    }

    #[test]
    fn test_backoff_validation() {
        assert!(Backoff::Jittered {
            min_ms: 10,
            max_ms: 5
        }
        .validate()
        .is_err());
        assert!(Backoff::Exponential {
            base_ms: 10,
            max_ms: 100,
            jitter: 1.5
        }
        .validate()
        .is_err());
        assert!(Backoff::default().validate().is_ok());
    }

    #[test]
    fn test_policy_rejects_zero_attempts() {
        let mut policy = RetryPolicy::default();
        policy.max_attempts = Some(0);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_budget_honours_max_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 3);
        let mut budget = RetryBudget::new(&policy);
        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_none());
        assert_eq!(budget.failures(), 3);
    }

    #[test]
    fn test_budget_reset_restores_attempts() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 2);
        let mut budget = RetryBudget::new(&policy);
        assert!(budget.next_delay().is_some());
        budget.reset();
        assert!(budget.next_delay().is_some());
        assert!(budget.next_delay().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_honours_deadline() {
        let policy = RetryPolicy {
            max_attempts: None,
            deadline_secs: Some(10),
            backoff: Backoff::Fixed { delay_ms: 4000 },
        };
        let mut budget = RetryBudget::new(&policy);
        assert!(budget.next_delay().is_some());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(budget.next_delay().is_some());
        tokio::time::advance(Duration::from_secs(4)).await;
        // 8s elapsed + 4s delay exceeds the 10s budget
        assert!(budget.next_delay().is_none());
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = RetryPolicy::unbounded_jittered(Duration::ZERO, Duration::ZERO);
        assert!(policy.is_unbounded());
        let mut budget = RetryBudget::new(&policy);
        for _ in 0..10_000 {
            assert!(budget.next_delay().is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = sleep(Duration::from_secs(3600), &cancel).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 5);
        let result = retry(&policy, &CancellationToken::new(), "op", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError(ErrorClass::Transient))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 5);
        let result: Result<(), _> = retry(&policy, &CancellationToken::new(), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError(ErrorClass::Permanent)) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1), 3);
        let result: Result<(), _> = retry(&policy, &CancellationToken::new(), "op", |_| async {
            Err(TestError(ErrorClass::Transient))
        })
        .await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }
    }
}
