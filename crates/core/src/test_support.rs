// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builders for tests in this and other crates.
//!
//! Gated behind the `test-support` feature so production builds never
//! see them.

use crate::change::{ChangeEvent, FileChange};
use crate::task::{Task, TaskContext, TaskId, TaskKpis, TaskResult, TaskStatus};
use crate::worker::WorkerKind;
use std::path::PathBuf;

/// Builder for [`ChangeEvent`] with small-change defaults.
pub struct ChangeEventBuilder {
    event: ChangeEvent,
}

impl ChangeEventBuilder {
    pub fn new() -> Self {
        Self {
            event: ChangeEvent {
                repo: "acme/widgets".to_string(),
                branch: "feature/x".to_string(),
                commit: "0123abcd".to_string(),
                files: Vec::new(),
                author: "dev@example.com".to_string(),
                message: "tweak the widget".to_string(),
                timestamp_ms: 1_700_000_000_000,
            },
        }
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.event.branch = branch.to_string();
        self
    }

    pub fn file(mut self, path: &str, added: u32, removed: u32) -> Self {
        self.event.files.push(FileChange::new(path, added, removed));
        self
    }

    /// Add `n` files named `src/mod{i}.rs`, each with `lines` added.
    pub fn files(mut self, n: usize, lines: u32) -> Self {
        for i in 0..n {
            self.event.files.push(FileChange::new(format!("src/mod{i}.rs"), lines, 0));
        }
        self
    }

    pub fn build(self) -> ChangeEvent {
        self.event
    }
}

impl Default for ChangeEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal task aimed at `target`.
pub fn task(target: WorkerKind) -> Task {
    Task {
        id: TaskId::new(),
        target,
        scope: vec![PathBuf::from("src/lib.rs")],
        context: TaskContext {
            repo_root: PathBuf::from("/work/acme"),
            commit: "0123abcd".to_string(),
            branch: "feature/x".to_string(),
        },
        output: PathBuf::from("/work/reports/out.json"),
        config: serde_json::Map::new(),
        deadline_ms: 30_000,
    }
}

/// A successful result for `task_id` with the given finding count.
pub fn done_result(task_id: TaskId, findings: u64) -> TaskResult {
    TaskResult {
        task_id,
        status: TaskStatus::Done,
        artifacts: vec![PathBuf::from("/work/reports/out.json")],
        results: serde_json::json!({ "findings": findings }),
        kpis: TaskKpis { latency_ms: 120, tokens: 900, findings },
        error: None,
    }
}
