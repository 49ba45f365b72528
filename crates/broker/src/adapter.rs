// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatch capability seam.
//!
//! The workflow engine depends on this trait, not on the broker
//! directly, so tests can drive runs against an in-process fake and
//! alternate transports can slot in without touching the engine.

use async_trait::async_trait;
use crew_core::{Clock, OrchestratorError, Task, TaskResult, WorkerHealth, WorkerKind};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::server::Broker;

#[async_trait]
pub trait DispatchAdapter: Send + Sync {
    /// Deliver a task and await its terminal outcome.
    async fn deliver(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, OrchestratorError>;

    /// Fire-and-forget event to every connected worker.
    fn broadcast(&self, name: &str, payload: serde_json::Value);

    /// Current registry health, used for routing decisions.
    fn snapshot_health(&self) -> HashMap<WorkerKind, WorkerHealth>;
}

#[async_trait]
impl<C: Clock> DispatchAdapter for Broker<C> {
    async fn deliver(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, OrchestratorError> {
        Broker::deliver(self, task, cancel).await
    }

    fn broadcast(&self, name: &str, payload: serde_json::Value) {
        Broker::broadcast(self, name, payload)
    }

    fn snapshot_health(&self) -> HashMap<WorkerKind, WorkerHealth> {
        Broker::snapshot_health(self)
    }
}
