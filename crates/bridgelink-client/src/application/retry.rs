//! Retry executor: runs a fallible async operation under a [`BackoffPolicy`].
//!
//! # Behaviour
//!
//! 1. Run the operation.
//! 2. On success, return the value.
//! 3. On failure:
//!    a. If the predicate rejects the error, return it immediately.
//!    b. If the attempt budget (`max_retries + 1`) is spent, return it.
//!    c. Otherwise wait the backoff delay (at least the server's
//!       `Retry-After` for rate limits) and go to 1.
//!
//! There is no wait after the final failure.  Both the wait and the
//! operation itself race the executor's [`CancellationToken`]; cancelling
//! drops the in-flight future (aborting its connection) and yields
//! [`TransportError::Cancelled`].
//!
//! [`RetryExecutor::with_timeout`] races a whole future, retries included,
//! against a hard deadline and fails with [`TransportError::Timeout`] no
//! matter how much retry budget is left.

use std::future::Future;
use std::time::Duration;

use bridgelink_core::{BackoffPolicy, TransportError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default hard deadline around a retried operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Book-keeping for one logical operation, discarded when it finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    /// 0-indexed attempt about to run (or that just failed).
    pub attempt: u32,
    /// Total time spent waiting between attempts so far.
    pub cumulative_delay: Duration,
    pub last_error: Option<TransportError>,
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: BackoffPolicy,
    operation_timeout: Duration,
    cancel: CancellationToken,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl RetryExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Ties every operation run by this executor to `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Retries `operation` on network-classified errors.
    pub async fn retry<T, F, Fut>(&self, operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.retry_if(operation, TransportError::is_retryable).await
    }

    /// Retries `operation` while `should_retry` accepts the error.
    pub async fn retry_if<T, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        P: Fn(&TransportError) -> bool,
    {
        let mut state = RetryState::default();
        let max_attempts = self.policy.max_attempts();

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                result = operation() => result,
            };

            let error = match outcome {
                Ok(value) => {
                    if state.attempt > 0 {
                        debug!(
                            attempts = state.attempt + 1,
                            waited_ms = state.cumulative_delay.as_millis() as u64,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !should_retry(&error) {
                debug!(attempt = state.attempt, %error, "error is not retryable");
                return Err(error);
            }
            if state.attempt + 1 >= max_attempts {
                warn!(attempts = state.attempt + 1, %error, "retry budget exhausted");
                return Err(error);
            }

            let mut wait = self.policy.delay(state.attempt);
            if let Some(retry_after) = error.retry_after() {
                wait = wait.max(retry_after);
            }
            debug!(
                attempt = state.attempt,
                wait_ms = wait.as_millis() as u64,
                %error,
                "retrying after backoff"
            );
            state.last_error = Some(error);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            state.cumulative_delay += wait;
            state.attempt += 1;
        }
    }

    /// Races `future` against the operation timeout.
    pub async fn with_timeout<T, Fut>(&self, future: Fut) -> Result<T, TransportError>
    where
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.operation_timeout, future).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "operation deadline exceeded"
                );
                Err(TransportError::Timeout(self.operation_timeout))
            }
        }
    }

    /// [`retry`](Self::retry) bounded by the operation timeout.
    pub async fn retry_with_timeout<T, F, Fut>(&self, operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.with_timeout(self.retry(operation)).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
