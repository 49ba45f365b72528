// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-run workflow state and the final result shape.

use crate::error::OrchestratorError;
use crate::id::{Id, IdTag};
use crate::task::{TaskId, TaskKpis, TaskResult, TaskStatus};
use crate::worker::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Marker for the run id space.
pub enum RunTag {}

impl IdTag for RunTag {
    const PREFIX: &'static str = "run-";
}

/// Identifier of one workflow run.
pub type RunId = Id<RunTag>;

/// Workflow phases. Strictly monotonic: a run never revisits a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Route,
    Dispatch,
    Collect,
    Synthesize,
    Gate,
    Finalize,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Route => "route",
            RunPhase::Dispatch => "dispatch",
            RunPhase::Collect => "collect",
            RunPhase::Synthesize => "synthesize",
            RunPhase::Gate => "gate",
            RunPhase::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Status of a task in the run table. Supersets the wire-level terminal
/// statuses with the pre-terminal pending/running states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Timeout,
    Cancelled,
}

impl RunTaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunTaskStatus::Pending | RunTaskStatus::Running)
    }
}

impl From<TaskStatus> for RunTaskStatus {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Done => RunTaskStatus::Done,
            TaskStatus::Failed => RunTaskStatus::Failed,
            TaskStatus::Timeout => RunTaskStatus::Timeout,
            TaskStatus::Cancelled => RunTaskStatus::Cancelled,
        }
    }
}

/// Finding severity, ordered. Used for the gate's blocking threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other:?}")),
        }
    }
}

/// Running token/cost totals accumulated from task KPIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub tokens: u64,
    pub findings: u64,
    pub latency_ms: u64,
}

impl RunTotals {
    pub fn absorb(&mut self, kpis: &TaskKpis) {
        self.tokens += kpis.tokens;
        self.findings += kpis.findings;
        self.latency_ms += kpis.latency_ms;
    }
}

/// The gate's verdict over a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

/// Final decision of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    RequestChanges,
    NeedsWork,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Approve => "approve",
            Decision::RequestChanges => "request_changes",
            Decision::NeedsWork => "needs_work",
        };
        f.write_str(s)
    }
}

/// Mutable state of one workflow run. Created at ROUTE, dropped after
/// FINALIZE. Owned by the run's workflow task; worker tasks feed it
/// through resolved futures, never by direct mutation.
#[derive(Debug)]
pub struct RunState {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub selected: Vec<WorkerKind>,
    pub tasks: HashMap<TaskId, RunTaskStatus>,
    pub results: Vec<TaskResult>,
    pub totals: RunTotals,
    pub errors: Vec<OrchestratorError>,
    pub verdict: Option<GateVerdict>,
    pub started_at_ms: u64,
}

impl RunState {
    pub fn new(run_id: RunId, started_at_ms: u64) -> Self {
        Self {
            run_id,
            phase: RunPhase::Route,
            selected: Vec::new(),
            tasks: HashMap::new(),
            results: Vec::new(),
            totals: RunTotals::default(),
            errors: Vec::new(),
            verdict: None,
            started_at_ms,
        }
    }

    /// Advance to `next`. Phases only move forward; a backwards move is
    /// an invariant breach.
    pub fn advance(&mut self, next: RunPhase) -> Result<(), OrchestratorError> {
        if next <= self.phase {
            return Err(OrchestratorError::Fatal(format!(
                "run {} phase regression: {} -> {}",
                self.run_id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Record a terminal result: updates the task table, totals, and the
    /// collected result list. A result for an unknown task id is an
    /// invariant breach.
    pub fn record_result(&mut self, result: TaskResult) -> Result<(), OrchestratorError> {
        let entry = self.tasks.get_mut(&result.task_id).ok_or_else(|| {
            OrchestratorError::Fatal(format!(
                "run {} received result for unknown task {}",
                self.run_id, result.task_id
            ))
        })?;
        *entry = result.status.into();
        self.totals.absorb(&result.kpis);
        self.results.push(result);
        Ok(())
    }

    /// Number of tasks not yet terminal.
    pub fn open_task_count(&self) -> usize {
        self.tasks.values().filter(|s| !s.is_terminal()).count()
    }
}

/// Per-worker contribution section of a [`WorkflowResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerContribution {
    pub worker: WorkerKind,
    pub status: TaskStatus,
    pub artifacts: Vec<PathBuf>,
    pub kpis: TaskKpis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The emitted result of a run. Always carries a decision and every
/// selected worker's contribution; no partial silent success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub decision: Decision,
    pub summary: String,
    pub critical_issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub contributions: Vec<WorkerContribution>,
    pub totals: RunTotals,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
