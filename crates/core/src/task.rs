// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tasks dispatched to workers and their results.

use crate::id::{Id, IdTag};
use crate::worker::WorkerKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Marker for the task id space.
pub enum TaskTag {}

impl IdTag for TaskTag {
    const PREFIX: &'static str = "task-";
}

/// Unique task identifier within a run.
pub type TaskId = Id<TaskTag>;

/// Repository coordinates shared by every task of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub repo_root: PathBuf,
    pub commit: String,
    pub branch: String,
}

/// One unit of work sent to a worker. Immutable per dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: WorkerKind,
    /// Subset of the change event's files this worker should look at.
    pub scope: Vec<PathBuf>,
    pub context: TaskContext,
    /// Where the worker writes its report artifact.
    pub output: PathBuf,
    /// Per-worker configuration passed through opaquely.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub deadline_ms: u64,
}

/// Terminal status of a task, as reported by the worker (or synthesized
/// by the broker on timeout/cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Done,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

/// Per-task performance indicators reported by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKpis {
    pub latency_ms: u64,
    pub tokens: u64,
    pub findings: u64,
}

/// A worker's reply to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default)]
    pub kpis: TaskKpis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// Synthesize a terminal result for a task the worker never answered.
    pub fn terminal(task_id: TaskId, status: TaskStatus, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            artifacts: Vec::new(),
            results: serde_json::Value::Null,
            kpis: TaskKpis::default(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
