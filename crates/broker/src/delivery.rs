// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task delivery and response correlation.
//!
//! `deliver` frames a task onto the target worker's outbound queue and
//! returns when the matching response arrives, the run is cancelled, or
//! the handle dies. A response resolves its future exactly once;
//! duplicates are discarded.

use crew_core::{Clock, OrchestratorError, Task, TaskResult, WorkerKind};
use crew_wire::{Envelope, EventData, MessageKind, TaskData, TaskResponseData};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::HandleId;
use crate::server::{Broker, Pending};

impl<C: Clock> Broker<C> {
    /// Deliver `task` to its target worker and await the response.
    ///
    /// Requires the handle to be accepting (idle or busy, below the
    /// per-worker cap); marks it busy and tracks the task id until the
    /// future resolves.
    pub async fn deliver(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let kind = task.target;
        let task_id = task.id;

        // Duplicate ids would cross-resolve futures; refuse loudly.
        if self.pending.lock().contains_key(&task_id) {
            return Err(OrchestratorError::Fatal(format!(
                "duplicate task id {task_id} in delivery"
            )));
        }

        let handle_id = self.registry.reserve(kind, task_id, self.config.per_worker_task_cap)?;

        let envelope = Envelope::new(
            task_id.as_str(),
            MessageKind::Task,
            kind.as_str(),
            self.clock.timestamp(),
            match serde_json::to_value(TaskData::from(&task)) {
                Ok(value) => value,
                Err(e) => {
                    self.registry.release(kind, &task_id);
                    return Err(OrchestratorError::Fatal(format!("task serialization: {e}")));
                }
            },
        );
        let bytes = match crew_wire::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.registry.release(kind, &task_id);
                return Err(OrchestratorError::ProtocolViolation(e.to_string()));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(task_id, Pending { tx, kind, handle: handle_id });

        let outbound = match self.registry.outbound(kind) {
            Some((id, outbound)) if id == handle_id => outbound,
            _ => {
                self.pending.lock().remove(&task_id);
                self.registry.release(kind, &task_id);
                return Err(OrchestratorError::WorkerUnavailable(kind));
            }
        };
        if let Err(e) = outbound.try_send(bytes) {
            // Queue full: the worker is falling behind. Degrade it so
            // the router stops selecting it until the queue drains.
            self.pending.lock().remove(&task_id);
            self.registry.release(kind, &task_id);
            if matches!(e, tokio::sync::mpsc::error::TrySendError::Full(_)) {
                warn!(worker = %kind, "outbound queue full, degrading worker");
                self.registry.degrade(kind);
            }
            return Err(OrchestratorError::WorkerUnavailable(kind));
        }
        debug!(worker = %kind, task = %task_id, "task delivered");

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&task_id);
                self.registry.release(kind, &task_id);
                Err(OrchestratorError::Cancelled)
            }
            result = rx => match result {
                Ok(outcome) => outcome,
                // Sender dropped without resolving: broker went away.
                Err(_) => Err(OrchestratorError::Transient("broker shut down".to_string())),
            },
        }
    }

    /// Resolve the future matching an incoming `task` response frame.
    pub(crate) fn complete_response(
        &self,
        kind: WorkerKind,
        handle_id: HandleId,
        envelope: Envelope,
    ) {
        let task_id = crew_core::TaskId::from_string(&envelope.id);
        let response: TaskResponseData = match envelope.data_as() {
            Ok(response) => response,
            Err(e) => {
                warn!(worker = %kind, task = %task_id, error = %e, "unparseable task response");
                return;
            }
        };

        let pending = {
            let mut map = self.pending.lock();
            match map.get(&task_id) {
                Some(p) if p.kind == kind && p.handle == handle_id => map.remove(&task_id),
                Some(_) => {
                    warn!(worker = %kind, task = %task_id, "response from wrong handle, discarded");
                    return;
                }
                None => {
                    // Duplicate or stale response after eviction.
                    debug!(worker = %kind, task = %task_id, "no pending future, discarded");
                    return;
                }
            }
        };
        self.registry.release(kind, &task_id);

        if let Some(p) = pending {
            let result = TaskResult {
                task_id,
                status: response.status,
                artifacts: response.artifacts,
                results: response.results,
                kpis: response.kpis,
                error: response.error,
            };
            let _ = p.tx.send(Ok(result));
        }
    }

    /// Fail the given outstanding tasks of a dead handle.
    pub(crate) fn fail_tasks<F>(
        &self,
        kind: WorkerKind,
        handle_id: HandleId,
        tasks: &[crew_core::TaskId],
        make_error: F,
    ) where
        F: Fn(WorkerKind) -> OrchestratorError,
    {
        let mut map = self.pending.lock();
        for task_id in tasks {
            match map.get(task_id) {
                Some(p) if p.kind == kind && p.handle == handle_id => {
                    if let Some(p) = map.remove(task_id) {
                        let _ = p.tx.send(Err(make_error(kind)));
                    }
                }
                _ => {}
            }
        }
    }

    /// Write an event frame to every healthy handle. Partial failures
    /// are logged and do not fail the call.
    pub fn broadcast(&self, name: &str, payload: serde_json::Value) {
        let data = EventData { name: name.to_string(), payload };
        let envelope = match serde_json::to_value(&data) {
            Ok(value) => self.new_envelope(MessageKind::Event, value),
            Err(e) => {
                warn!(event = name, error = %e, "broadcast payload not serializable");
                return;
            }
        };
        let bytes = match crew_wire::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(event = name, error = %e, "broadcast encode failed");
                return;
            }
        };
        for (kind, outbound) in self.registry.broadcast_targets() {
            if outbound.try_send(bytes.clone()).is_err() {
                debug!(worker = %kind, event = name, "broadcast dropped for slow worker");
            }
        }
    }

}

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;
