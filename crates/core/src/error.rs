// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared error taxonomy.
//!
//! Every crate converts its internal errors into [`OrchestratorError`]
//! at its public seam. The retry policy and the circuit breaker key off
//! [`OrchestratorError::is_transient`]; cancellation is excluded from
//! failure accounting via [`OrchestratorError::is_cancelled`].

use crate::worker::WorkerKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Network blip, timeout, worker restart. Retried per policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A named circuit breaker refused the call fast.
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    /// Pool acquisition timed out with all streams busy.
    #[error("connection pool exhausted after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// Pool acquisition after shutdown.
    #[error("connection pool is closed")]
    PoolClosed,

    /// No live handle for a required identity.
    #[error("no available worker for {0}")]
    WorkerUnavailable(WorkerKind),

    /// Heartbeat or task deadline exceeded.
    #[error("worker {0} timed out")]
    WorkerTimeout(WorkerKind),

    /// Bad token or identity outside the allow-list. Never retried.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Malformed frame or unexpected message during a handshake step.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Approval request rejected or expired.
    #[error("not approved: {0}")]
    NotApproved(String),

    /// Cooperative cancellation. Idempotent; not a failure for KPIs.
    #[error("cancelled")]
    Cancelled,

    /// Invariant breach. Aborts the run and surfaces unwrapped.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl OrchestratorError {
    /// Whether a retry policy may re-attempt after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transient(_)
                | OrchestratorError::WorkerTimeout(_)
                | OrchestratorError::PoolExhausted { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OrchestratorError::Cancelled)
    }

    /// Fatal errors must surface unwrapped; everything else attaches to
    /// run state and flows to the gate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Fatal(_))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
