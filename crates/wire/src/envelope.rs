// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The message envelope and its typed payloads.
//!
//! Every frame is `{ id, type, agent, timestamp, data }`. The `data`
//! block travels as raw JSON; both sides decode it into the typed
//! payload matching `type`. For task frames the envelope `id` is the
//! task id, and the worker's response reuses it.

use crew_core::{Task, TaskKpis, TaskStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Auth,
    Registration,
    Task,
    Event,
    Heartbeat,
    Ping,
    Pong,
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Worker identity string (`security`, `quality`, ...). The broker
    /// sends frames with agent `broker`.
    pub agent: String,
    /// RFC 3339.
    pub timestamp: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        kind: MessageKind,
        agent: impl Into<String>,
        timestamp: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self { id: id.into(), kind, agent: agent.into(), timestamp: timestamp.into(), data }
    }

    /// Decode the data block as a typed payload.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// `auth` payload, the mandatory first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: String,
    pub agent_id: String,
}

/// `registration` payload, sent after a successful auth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationData {
    pub pid: u32,
    /// Free-form capability strings, logged but not interpreted.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `task` payload (broker → worker). The envelope id is the task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    pub scope: Vec<PathBuf>,
    pub context: crew_core::TaskContext,
    pub output: PathBuf,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub deadline_ms: u64,
}

impl From<&Task> for TaskData {
    fn from(task: &Task) -> Self {
        Self {
            scope: task.scope.clone(),
            context: task.context.clone(),
            output: task.output.clone(),
            config: task.config.clone(),
            deadline_ms: task.deadline_ms,
        }
    }
}

/// `task` payload (worker → broker), correlated by envelope id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponseData {
    pub status: TaskStatus,
    #[serde(default)]
    pub results: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub kpis: TaskKpis,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

/// `event` payload: broker notifications (`worker_registered`,
/// `worker_evicted`, approval outcomes, run completion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
