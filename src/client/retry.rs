//! Retries for control requests
//!
//! Operation id allocation, status queries and kill requests are small and
//! idempotent, so transient failures (connection errors, 5xx) are retried with
//! capped exponential backoff and full jitter. Every wait observes the
//! session's cancellation token. The streamed bulk-insert request is never
//! retried: its body cannot be replayed.

use crate::config::BulkInsertConfiguration;
use crate::error::BulkInsertError;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Control endpoint a retried request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    NextOperationId,
    OperationState(i64),
    KillOperation(i64),
}

impl ControlRequest {
    /// Operation the request is about, if any
    pub fn operation_id(&self) -> Option<i64> {
        match self {
            ControlRequest::NextOperationId => None,
            ControlRequest::OperationState(id) | ControlRequest::KillOperation(id) => Some(*id),
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::NextOperationId => write!(f, "next-operation-id"),
            ControlRequest::OperationState(id) => write!(f, "operation state of {}", id),
            ControlRequest::KillOperation(id) => write!(f, "kill of operation {}", id),
        }
    }
}

/// Backoff policy for control requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each one after
    pub base_delay_ms: u64,
    /// Upper bound of a single delay
    pub max_delay_ms: u64,
    /// Full jitter: each delay is drawn uniformly from `0..=delay`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter: true,
        }
    }

    /// Policy from the client configuration's `retry_*` settings
    pub fn from_configuration(config: &BulkInsertConfiguration) -> Self {
        Self::new(
            config.retry_max_attempts,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
    }

    /// Run `attempt` until it succeeds, fails for good or is cancelled
    ///
    /// # Arguments
    ///
    /// * `request` - Endpoint being called, for logs and the final error
    /// * `cancel` - Interrupts both in-flight attempts and backoff waits
    /// * `attempt` - Issues one request
    ///
    /// # Errors
    ///
    /// - the first non-retryable error, unchanged
    /// - `Cancelled` if `cancel` fires
    /// - `RetryExhausted` naming the request if every attempt failed transiently
    pub async fn execute<F, Fut, T>(
        &self,
        request: ControlRequest,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, BulkInsertError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BulkInsertError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for n in 0..attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(request)),
                result = attempt() => result,
            };
            let error = match result {
                Ok(value) => {
                    if n > 0 {
                        debug!(%request, operation_id = ?request.operation_id(), attempts = n + 1, "Control request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if n + 1 < attempts {
                let delay = self.backoff(n);
                warn!(
                    %request,
                    operation_id = ?request.operation_id(),
                    attempt = n + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Control request failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled(request)),
                    _ = sleep(delay) => {}
                }
            }
            last_error = Some(error);
        }

        Err(BulkInsertError::RetryExhausted(format!(
            "{} failed after {} attempts: {}",
            request,
            attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )))
    }

    /// Delay after the zero-based `attempt`
    fn backoff(&self, attempt: u32) -> Duration {
        let capped_ms = self
            .base_delay_ms
            .saturating_mul(1 << attempt.min(20))
            .min(self.max_delay_ms);
        if self.jitter {
            Duration::from_millis(rand::thread_rng().gen_range(0..=capped_ms))
        } else {
            Duration::from_millis(capped_ms)
        }
    }
}

fn cancelled(request: ControlRequest) -> BulkInsertError {
    BulkInsertError::Cancelled(format!("Cancelled during {}", request))
}
