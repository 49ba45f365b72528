// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exponential backoff with jitter, guarded by a retry predicate.

use crew_core::{OrchestratorError, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides per-error whether another attempt is worth it.
pub type RetryPredicate = fn(&OrchestratorError) -> bool;

fn default_predicate(err: &OrchestratorError) -> bool {
    err.is_transient()
}

/// Retry policy: bounded attempts with jittered exponential backoff.
///
/// Non-retryable errors surface immediately; cancellation stops the
/// loop before the next backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: RetryPredicate,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, predicate: default_predicate }
    }

    /// Replace the default transient-only predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Backoff after the given failed attempt (1-indexed):
    /// `min(base · multiplier^(attempt-1) · (1 + rand·0.1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let jitter = 1.0 + rand::random::<f64>() * 0.1;
        let ms = (self.config.base_ms as f64 * exp * jitter).min(self.config.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `op` up to `max_attempts` times. The closure receives the
    /// 1-indexed attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    if attempt >= self.config.max_attempts || !(self.predicate)(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
