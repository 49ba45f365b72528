// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handshake authentication and per-identity rate limiting.

use crew_core::{BrokerConfig, OrchestratorError, WorkerKind};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

/// Sliding-window tracker of failed auth attempts per claimed identity.
///
/// Once an identity accumulates `max_attempts` failures inside
/// `window_ms`, further attempts are rejected before any token
/// comparison happens.
pub(crate) struct AuthLimiter {
    window_ms: u64,
    max_attempts: u32,
    failures: HashMap<String, VecDeque<u64>>,
}

impl AuthLimiter {
    pub fn new(window_ms: u64, max_attempts: u32) -> Self {
        Self { window_ms, max_attempts, failures: HashMap::new() }
    }

    /// Whether this identity is currently locked out.
    pub fn is_disqualified(&mut self, peer: &str, now_ms: u64) -> bool {
        match self.failures.get_mut(peer) {
            Some(window) => {
                while window.front().is_some_and(|t| now_ms.saturating_sub(*t) > self.window_ms) {
                    window.pop_front();
                }
                window.len() >= self.max_attempts as usize
            }
            None => false,
        }
    }

    pub fn record_failure(&mut self, peer: &str, now_ms: u64) {
        self.failures.entry(peer.to_string()).or_default().push_back(now_ms);
    }

    /// Successful auth clears the identity's failure window.
    pub fn record_success(&mut self, peer: &str) {
        self.failures.remove(peer);
    }
}

/// Validate an auth payload against the process secret and the
/// identity allow-list. Returns the authenticated worker kind.
pub(crate) fn verify(
    config: &BrokerConfig,
    secret: &str,
    token: &str,
    agent_id: &str,
) -> Result<WorkerKind, OrchestratorError> {
    if token != secret {
        return Err(OrchestratorError::AuthenticationFailed("invalid token".to_string()));
    }
    let kind = WorkerKind::from_str(agent_id).map_err(|_| {
        OrchestratorError::AuthenticationFailed(format!("unknown identity {agent_id:?}"))
    })?;
    if !config.allowed_agents.is_empty() && !config.allowed_agents.contains(&kind) {
        return Err(OrchestratorError::AuthenticationFailed(format!(
            "identity {kind} not in allow-list"
        )));
    }
    Ok(kind)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
