// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health snapshot types surfaced by the driver `health()` call.

use crate::worker::{WorkerKind, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One registered worker's observed health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: WorkerStatus,
    pub queue_depth: usize,
    pub last_heartbeat_ms: u64,
    /// Exponentially-weighted ping round-trip, milliseconds.
    pub ewma_latency_ms: f64,
}

/// One named circuit breaker's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub state: String,
    pub failures: u64,
    pub state_changes: u64,
}

/// One connection pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub size: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// Aggregate snapshot for `health()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub workers: HashMap<WorkerKind, WorkerHealth>,
    pub breakers: HashMap<String, BreakerHealth>,
    pub pools: HashMap<String, PoolHealth>,
}

impl HealthSnapshot {
    pub fn worker(&self, kind: WorkerKind) -> Option<&WorkerHealth> {
        self.workers.get(&kind)
    }
}
