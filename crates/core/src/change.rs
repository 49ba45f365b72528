// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Source-control change events, the input of every workflow run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One changed file with its line delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub lines_added: u32,
    pub lines_removed: u32,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, lines_added: u32, lines_removed: u32) -> Self {
        Self { path: path.into(), lines_added, lines_removed }
    }
}

/// Immutable description of a pushed change. Created by the driver,
/// consumed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub repo: String,
    pub branch: String,
    pub commit: String,
    pub files: Vec<FileChange>,
    pub author: String,
    pub message: String,
    pub timestamp_ms: u64,
}

impl ChangeEvent {
    /// Sum of added and removed lines across all files.
    pub fn total_lines_changed(&self) -> u64 {
        self.files
            .iter()
            .map(|f| u64::from(f.lines_added) + u64::from(f.lines_removed))
            .sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Iterator over changed paths as lossy strings, for pattern rules.
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.files.iter().map(|f| f.path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
#[path = "change_tests.rs"]
mod tests;
