//! Retry wrapper for unary coordinator calls.
//!
//! Delays grow exponentially from `initial_delay` and are capped by
//! `max_delay`; with jitter enabled each delay is drawn uniformly from
//! `[0, delay)`. A retry sequence ends on success, when the give-up
//! classifier rejects an error, or once `max_tries` / `max_time` is reached.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fedlink_core::constants::MAX_RETRY_DELAY;
use fedlink_transport::RpcError;
use rand::Rng;
use tokio::time::Instant;

use crate::error::ClientError;

/// Backoff parameters of a [`RetryInvoker`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of a single delay.
    pub max_delay: Option<Duration>,
    /// Total attempts, including the first.
    pub max_tries: Option<u32>,
    /// Wall-clock budget measured from the first attempt.
    pub max_time: Option<Duration>,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Some(MAX_RETRY_DELAY),
            max_tries: None,
            max_time: None,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if let Some(max_delay) = self.max_delay {
            secs = secs.min(max_delay.as_secs_f64());
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
        base.mul_f64(factor)
    }
}

/// Doubles `backoff` without overflowing, bounded by `cap`.
pub(crate) fn doubled_backoff(backoff: Duration, cap: Duration) -> Duration {
    backoff.saturating_mul(2).min(cap)
}

/// Decides whether an error ends the retry sequence.
pub type GiveUpFn = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// Executes a call repeatedly under a [`RetryPolicy`].
///
/// The policy is immutable once built; derive a different invoker with
/// [`RetryInvoker::without_retries`] instead of mutating a shared one.
#[derive(Clone)]
pub struct RetryInvoker {
    policy: RetryPolicy,
    should_giveup: GiveUpFn,
}

impl fmt::Debug for RetryInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryInvoker")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryInvoker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryInvoker {
    /// Retries transient errors and gives up on everything else.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_giveup: Arc::new(|err: &RpcError| !err.is_transient()),
        }
    }

    pub fn with_giveup<F>(mut self, should_giveup: F) -> Self
    where
        F: Fn(&RpcError) -> bool + Send + Sync + 'static,
    {
        self.should_giveup = Arc::new(should_giveup);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same classifier, exactly one attempt.
    pub fn without_retries(&self) -> Self {
        Self {
            policy: RetryPolicy {
                max_tries: Some(1),
                ..self.policy.clone()
            },
            should_giveup: Arc::clone(&self.should_giveup),
        }
    }

    /// Runs `call` until it succeeds or the policy gives up.
    ///
    /// The final error is translated into a [`ClientError`]; a
    /// permission-denied status becomes [`ClientError::RunNotRunning`].
    pub async fn invoke<T, F, Fut>(&self, mut call: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "call succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if (self.should_giveup)(&err) {
                tracing::debug!(attempt, error = %err, "giving up on non-retryable error");
                return Err(err.into());
            }
            if self.policy.max_tries.is_some_and(|max| attempt >= max) {
                tracing::warn!(attempt, error = %err, "retry attempts exhausted");
                return Err(err.into());
            }

            let mut delay = self.policy.delay(attempt);
            if let Some(max_time) = self.policy.max_time {
                let elapsed = started.elapsed();
                if elapsed >= max_time {
                    tracing::warn!(attempt, ?elapsed, error = %err, "retry time budget exhausted");
                    return Err(err.into());
                }
                delay = delay.min(max_time - elapsed);
            }

            tracing::warn!(attempt, ?delay, error = %err, "call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
