// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker identity and health status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of analysis worker identities.
///
/// Stable across process restarts; the wire name doubles as the
/// registration identity and the routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Security,
    Quality,
    Architecture,
    Documentation,
    Synthesizer,
    Observability,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::Security,
        WorkerKind::Quality,
        WorkerKind::Architecture,
        WorkerKind::Documentation,
        WorkerKind::Synthesizer,
        WorkerKind::Observability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Security => "security",
            WorkerKind::Quality => "quality",
            WorkerKind::Architecture => "architecture",
            WorkerKind::Documentation => "documentation",
            WorkerKind::Synthesizer => "synthesizer",
            WorkerKind::Observability => "observability",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = UnknownWorkerKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(WorkerKind::Security),
            "quality" => Ok(WorkerKind::Quality),
            "architecture" => Ok(WorkerKind::Architecture),
            "documentation" => Ok(WorkerKind::Documentation),
            "synthesizer" => Ok(WorkerKind::Synthesizer),
            "observability" => Ok(WorkerKind::Observability),
            other => Err(UnknownWorkerKind(other.to_string())),
        }
    }
}

/// Returned when parsing an identity string that names no known worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown worker kind: {0:?}")]
pub struct UnknownWorkerKind(pub String);

/// Observed status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Degraded,
    Error,
}

impl WorkerStatus {
    /// Whether a worker in this status may be handed new tasks.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Degraded => "degraded",
            WorkerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
