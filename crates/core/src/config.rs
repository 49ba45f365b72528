// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration types consumed by the broker, resilience, and engine
//! crates. All fields have serde defaults matching the documented
//! operational defaults, so a partial TOML file (or none at all) yields
//! a working daemon.

use crate::worker::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// IPC broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Interval of the dead-worker sweep.
    pub sweep_interval_ms: u64,
    pub auth_window_ms: u64,
    pub max_auth_attempts: u32,
    /// Identities allowed to register. Empty list admits all kinds.
    pub allowed_agents: Vec<WorkerKind>,
    /// In-flight tasks per worker before delivery is refused.
    pub per_worker_task_cap: usize,
    /// Outbound queue soft cap (frames) before a handle degrades.
    pub outbound_queue_cap: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("crewd.sock"),
            max_connections: 50,
            handshake_timeout_ms: 5_000,
            heartbeat_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            auth_window_ms: 60_000,
            max_auth_attempts: 5,
            allowed_agents: Vec::new(),
            per_worker_task_cap: 8,
            outbound_queue_cap: 256,
        }
    }
}

/// Client-side connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout_ms: u64,
    pub create_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub destroy_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            acquire_timeout_ms: 5_000,
            create_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            destroy_timeout_ms: 2_000,
            reconnect_base_ms: 1_000,
            reconnect_multiplier: 2.0,
            reconnect_max_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub timeout_ms: u64,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    pub fallback_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 60_000,
            success_threshold: 3,
            fallback_timeout_ms: 5_000,
        }
    }
}

/// Exponential backoff retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_ms: 1_000, multiplier: 2.0, max_ms: 30_000 }
    }
}

/// Router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing decision cache entry lifetime.
    pub cache_max_age_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { cache_max_age_ms: 60_000 }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Per-identity task timeout override.
    pub per_task_timeout_ms: HashMap<WorkerKind, u64>,
    pub default_task_timeout_ms: u64,
    /// Findings at or above this severity fail the gate.
    pub blocking_severity: crate::run::Severity,
    pub token_budget_warn: u64,
    pub latency_budget_warn_ms: u64,
    /// Where worker report artifacts land, one subdirectory per run.
    pub reports_dir: PathBuf,
}

impl WorkflowConfig {
    /// Effective timeout for one worker's task.
    pub fn task_timeout_ms(&self, kind: WorkerKind) -> u64 {
        self.per_task_timeout_ms
            .get(&kind)
            .copied()
            .unwrap_or(self.default_task_timeout_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            per_task_timeout_ms: HashMap::new(),
            default_task_timeout_ms: 30_000,
            blocking_severity: crate::run::Severity::High,
            token_budget_warn: 100_000,
            latency_budget_warn_ms: 120_000,
            reports_dir: PathBuf::from("/tmp/crew/reports"),
        }
    }
}

/// One operation kind requiring two-party approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalOperation {
    pub kind: String,
    /// Approvals needed before the operation proceeds.
    pub required_approvals: u32,
    pub timeout_ms: u64,
    /// Roles allowed to approve. Empty admits any role.
    pub required_roles: Vec<String>,
    /// Guard predicates over the operation payload: every key must be
    /// present in the payload and equal (or prefix-match for values
    /// ending in `*`).
    #[serde(default)]
    pub conditions: serde_json::Map<String, serde_json::Value>,
}

/// Approval gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub critical_operations: Vec<CriticalOperation>,
    pub allow_self_approval: bool,
    pub emergency_override_roles: Vec<String>,
    /// Skip the wait entirely (non-production environments).
    pub auto_approve: bool,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
