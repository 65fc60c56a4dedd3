//! Retry policy for step handlers.
//!
//! Only [`HandlerError::Transient`] failures are retried. The delay before
//! retry `n` (one-based) is
//!
//! ```text
//! backoff(n) = min(base_delay * multiplier^(n-1), max_delay)
//! ```
//!
//! and with jitter enabled the actual sleep is `backoff/2 + rand(0..=backoff/2)`
//! (equal jitter).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::HandlerError;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// What a step does once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// File an escalation carrying the last error and pause (default).
    #[default]
    Escalate,
    /// Escalate only if the last failure carried partial output, else fail.
    EscalateIfPartial,
    /// Fail the workflow.
    Fail,
}

/// Kind of step handler, used to pick a default retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerClass {
    Agent,
    Decision,
    Review,
    Custom,
}

impl HandlerClass {
    pub fn default_max_retries(&self) -> u32 {
        match self {
            Self::Agent | Self::Custom => 3,
            Self::Decision | Self::Review => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: HandlerClass::Agent.default_max_retries(),
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn for_class(class: HandlerClass) -> Self {
        Self {
            max_retries: class.default_max_retries(),
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay before retry `retry` (one-based).
    ///
    /// ```
    /// use std::time::Duration;
    /// use waypoint::orchestrator::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default().with_jitter(false);
    /// assert_eq!(policy.backoff(1), Duration::from_secs(1));
    /// assert_eq!(policy.backoff(3), Duration::from_secs(4));
    /// assert_eq!(policy.backoff(10), Duration::from_secs(30));
    /// ```
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay to actually sleep before retry `retry`, with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        if !self.jitter {
            return backoff;
        }
        let half = backoff / 2;
        let spread_ms = (backoff - half).as_millis() as u64;
        if spread_ms == 0 {
            return backoff;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread_ms))
    }
}

/// Backoff settings shared by every handler class, plus the retry budget of
/// each class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub agent_retries: u32,
    pub decision_retries: u32,
    pub review_retries: u32,
    pub custom_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            agent_retries: HandlerClass::Agent.default_max_retries(),
            decision_retries: HandlerClass::Decision.default_max_retries(),
            review_retries: HandlerClass::Review.default_max_retries(),
            custom_retries: HandlerClass::Custom.default_max_retries(),
        }
    }
}

impl RetryConfig {
    /// No sleeping between attempts. Budgets are unchanged.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn policy_for(&self, class: HandlerClass) -> RetryPolicy {
        let max_retries = match class {
            HandlerClass::Agent => self.agent_retries,
            HandlerClass::Decision => self.decision_retries,
            HandlerClass::Review => self.review_retries,
            HandlerClass::Custom => self.custom_retries,
        };
        RetryPolicy {
            max_retries,
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// `None` when cancelled before an attempt produced a result.
    pub result: Option<Result<T, HandlerError>>,
    pub attempts: u32,
    /// Message of each failed attempt, in order.
    pub errors: Vec<String>,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn was_cancelled(&self) -> bool {
        self.result.is_none()
    }
}

/// Run `op` until it succeeds, fails fatally, runs out of attempts or `cancel`
/// fires. `op` receives the one-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HandlerError>>,
{
    let mut errors = Vec::new();
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: None,
                attempts: attempt,
                errors,
            };
        }
        attempt += 1;

        let result = tokio::select! {
            result = op(attempt) => result,
            _ = cancel.cancelled() => {
                return RetryOutcome { result: None, attempts: attempt, errors };
            }
        };

        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Some(Ok(value)),
                    attempts: attempt,
                    errors,
                };
            }
            Err(err) => err,
        };
        errors.push(err.message().to_string());

        if !err.is_transient() || attempt >= policy.max_attempts() {
            return RetryOutcome {
                result: Some(Err(err)),
                attempts: attempt,
                errors,
            };
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts = policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome { result: None, attempts: attempt, errors };
            }
        }
    }
}
