// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker wrapping any fallible async call.
//!
//! State machine: CLOSED → OPEN on `failure_threshold` consecutive
//! failures; OPEN → HALF_OPEN taken by the next admission after
//! `timeout_ms` elapsed (no background timer); HALF_OPEN → CLOSED on
//! `success_threshold` consecutive probe successes, → OPEN on any probe
//! failure. Cancelled calls leave the state untouched.

use crew_core::{BreakerConfig, Clock, OrchestratorError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

/// Rolling response-time sample window.
const SAMPLE_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// A probe is in flight; half-open admits one call at a time.
    probing: bool,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    response_times_ms: VecDeque<u64>,
}

/// Aggregate counters, readable without touching breaker state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakerMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub state_changes: u64,
    pub mean_response_ms: f64,
    pub failure_rate: f64,
}

/// A named circuit breaker around one call-site.
pub struct CircuitBreaker<C: Clock> {
    name: String,
    config: BreakerConfig,
    clock: C,
    core: Mutex<BreakerCore>,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    state_changes: AtomicU64,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: C) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                probing: false,
                opened_at: None,
                last_failure_at: None,
                response_times_ms: VecDeque::with_capacity(SAMPLE_WINDOW),
            }),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing OPEN → HALF_OPEN if the open timeout
    /// has elapsed (reported, not committed; commitment happens on the
    /// next admission).
    pub fn state(&self) -> BreakerState {
        let core = self.core.lock();
        match core.state {
            BreakerState::Open if self.open_elapsed(&core) => BreakerState::HalfOpen,
            s => s,
        }
    }

    fn open_elapsed(&self, core: &BreakerCore) -> bool {
        match core.opened_at {
            Some(at) => {
                self.clock.now().duration_since(at) >= Duration::from_millis(self.config.timeout_ms)
            }
            None => true,
        }
    }

    fn transition(&self, core: &mut BreakerCore, next: BreakerState) {
        if core.state == next {
            return;
        }
        debug!(breaker = %self.name, from = core.state.as_str(), to = next.as_str(), "state change");
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        core.state = next;
        match next {
            BreakerState::Closed => {
                core.consecutive_failures = 0;
                core.opened_at = None;
                core.probing = false;
            }
            BreakerState::Open => {
                core.opened_at = Some(self.clock.now());
                core.probing = false;
            }
            BreakerState::HalfOpen => {
                core.half_open_successes = 0;
                core.probing = false;
            }
        }
    }

    /// Admission check. Returns an error when the circuit refuses the
    /// call; otherwise commits any pending OPEN → HALF_OPEN move and,
    /// in half-open, claims the single probe slot.
    fn admit(&self) -> Result<(), OrchestratorError> {
        let mut core = self.core.lock();
        match core.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if self.open_elapsed(&core) {
                    self.transition(&mut core, BreakerState::HalfOpen);
                    core.probing = true;
                    Ok(())
                } else {
                    Err(OrchestratorError::BreakerOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if core.probing {
                    // One probe at a time while testing recovery.
                    Err(OrchestratorError::BreakerOpen(self.name.clone()))
                } else {
                    core.probing = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut core = self.core.lock();
        push_sample(&mut core.response_times_ms, elapsed);
        match core.state {
            BreakerState::Closed => core.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                core.probing = false;
                core.half_open_successes += 1;
                if core.half_open_successes >= self.config.success_threshold {
                    self.transition(&mut core, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, elapsed: Duration, err: &OrchestratorError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if matches!(err, OrchestratorError::WorkerTimeout(_)) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        let mut core = self.core.lock();
        push_sample(&mut core.response_times_ms, elapsed);
        core.last_failure_at = Some(self.clock.now());
        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = core.consecutive_failures, "circuit opened");
                    self.transition(&mut core, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit reopened");
                self.transition(&mut core, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Execute `op` under the breaker.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.admit()?;
        let start = self.clock.now();
        let result = op().await;
        let elapsed = self.clock.now().duration_since(start);
        match &result {
            Ok(_) => self.record_success(elapsed),
            // Cancellation is not a failure; release the probe slot.
            Err(err) if err.is_cancelled() => {
                self.core.lock().probing = false;
            }
            Err(err) => self.record_failure(elapsed, err),
        }
        result
    }

    /// Execute with retries; only the terminal outcome is observed by
    /// the breaker's failure window.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.admit()?;
        let start = self.clock.now();
        let mut attempts = 0u32;
        let result = policy
            .run(cancel, |attempt| {
                attempts = attempt;
                op()
            })
            .await;
        if attempts > 1 {
            self.retries.fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
        }
        let elapsed = self.clock.now().duration_since(start);
        match &result {
            Ok(_) => self.record_success(elapsed),
            Err(err) if err.is_cancelled() => {
                self.core.lock().probing = false;
            }
            Err(err) => self.record_failure(elapsed, err),
        }
        result
    }

    /// Execute with a fallback: the fallback runs only after the
    /// primary path is exhausted, under its own deadline. A fallback
    /// timeout surfaces the primary error.
    pub async fn execute_with_fallback<T, F, Fut, FB, FutB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, OrchestratorError>>,
    {
        let primary = self.execute(op).await;
        let err = match primary {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };

        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, error = %err, "running fallback");
        let deadline = Duration::from_millis(self.config.fallback_timeout_ms);
        match tokio::time::timeout(deadline, fallback()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(breaker = %self.name, "fallback timed out");
                Err(err)
            }
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let core = self.core.lock();
        let requests = self.requests.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let mean = if core.response_times_ms.is_empty() {
            0.0
        } else {
            core.response_times_ms.iter().sum::<u64>() as f64 / core.response_times_ms.len() as f64
        };
        BreakerMetrics {
            requests,
            successes: self.successes.load(Ordering::Relaxed),
            failures,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            mean_response_ms: mean,
            failure_rate: if requests == 0 { 0.0 } else { failures as f64 / requests as f64 },
        }
    }
}

fn push_sample(window: &mut VecDeque<u64>, elapsed: Duration) {
    if window.len() == SAMPLE_WINDOW {
        window.pop_front();
    }
    window.push_back(elapsed.as_millis() as u64);
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
