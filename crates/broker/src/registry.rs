// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent registry: identity → live worker handle.
//!
//! The registry is the source of truth for dispatch. Handles are
//! referenced externally by [`HandleId`] tokens rather than pointers;
//! evicting a handle invalidates its token, so the broker's pending
//! maps can never resurrect a dead connection. Writes come only from
//! the accept loop and the sweep; reads are lock-held for O(1) lookups
//! and never block the read loops.

use crew_core::{OrchestratorError, TaskId, WorkerHealth, WorkerKind, WorkerStatus};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// EWMA smoothing factor for ping round-trips.
const LATENCY_ALPHA: f64 = 0.3;

/// Token identifying one installed handle. Monotonic across the
/// process; a re-registered identity gets a fresh token and the old
/// one stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Registry entry for one live worker connection.
pub(crate) struct WorkerHandle {
    pub id: HandleId,
    pub kind: WorkerKind,
    pub pid: u32,
    /// Encoded frames queued to the connection's writer task.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Cancelling this token tears the connection down.
    pub cancel: CancellationToken,
    pub status: WorkerStatus,
    pub last_heartbeat_ms: u64,
    pub inflight: HashSet<TaskId>,
    pub ewma_latency_ms: f64,
}

impl WorkerHandle {
    /// Outbound frames queued but not yet written.
    fn queue_depth(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    handles: RwLock<HashMap<WorkerKind, WorkerHandle>>,
    next_id: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handle for `kind`, replacing any prior registration.
    /// Returns the new token and, if an old handle was displaced, its
    /// token, in-flight task ids, and cancellation token (the caller
    /// destroys the old stream and fails its futures).
    pub(crate) fn install(
        &self,
        kind: WorkerKind,
        pid: u32,
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        now_ms: u64,
    ) -> (HandleId, Option<(HandleId, Vec<TaskId>, CancellationToken)>) {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = WorkerHandle {
            id,
            kind,
            pid,
            outbound,
            cancel,
            status: WorkerStatus::Idle,
            last_heartbeat_ms: now_ms,
            inflight: HashSet::new(),
            ewma_latency_ms: 0.0,
        };
        let old = self.handles.write().insert(kind, handle);
        (id, old.map(|h| (h.id, h.inflight.into_iter().collect(), h.cancel)))
    }

    /// Remove the handle for `kind` if its token still matches.
    /// Returns the evicted in-flight task ids.
    pub(crate) fn evict(
        &self,
        kind: WorkerKind,
        id: HandleId,
    ) -> Option<(Vec<TaskId>, CancellationToken)> {
        let mut handles = self.handles.write();
        match handles.get(&kind) {
            Some(h) if h.id == id => {}
            _ => return None,
        }
        handles.remove(&kind).map(|h| {
            debug!(worker = %kind, pid = h.pid, inflight = h.inflight.len(), "handle evicted");
            (h.inflight.into_iter().collect(), h.cancel)
        })
    }

    /// Reserve a delivery slot: requires an accepting status and room
    /// below `cap`. Marks the handle busy and tracks the task id.
    pub(crate) fn reserve(
        &self,
        kind: WorkerKind,
        task_id: TaskId,
        cap: usize,
    ) -> Result<HandleId, OrchestratorError> {
        let mut handles = self.handles.write();
        let handle = handles
            .get_mut(&kind)
            .ok_or(OrchestratorError::WorkerUnavailable(kind))?;
        if !handle.status.accepts_tasks() {
            return Err(OrchestratorError::WorkerUnavailable(kind));
        }
        if handle.inflight.len() >= cap {
            return Err(OrchestratorError::WorkerUnavailable(kind));
        }
        if !handle.inflight.insert(task_id) {
            return Err(OrchestratorError::Fatal(format!(
                "duplicate task id {task_id} in registry"
            )));
        }
        handle.status = WorkerStatus::Busy;
        Ok(handle.id)
    }

    /// Release a task id from its handle's in-flight set (response
    /// arrived, delivery failed, or the future was cancelled).
    pub(crate) fn release(&self, kind: WorkerKind, task_id: &TaskId) {
        let mut handles = self.handles.write();
        if let Some(handle) = handles.get_mut(&kind) {
            handle.inflight.remove(task_id);
            if handle.inflight.is_empty() && handle.status == WorkerStatus::Busy {
                handle.status = WorkerStatus::Idle;
            }
        }
    }

    pub(crate) fn heartbeat(&self, kind: WorkerKind, now_ms: u64) {
        if let Some(handle) = self.handles.write().get_mut(&kind) {
            handle.last_heartbeat_ms = now_ms;
        }
    }

    /// Fold a ping round-trip into the handle's EWMA latency.
    pub(crate) fn record_latency(&self, kind: WorkerKind, rtt_ms: u64) {
        if let Some(handle) = self.handles.write().get_mut(&kind) {
            handle.ewma_latency_ms = if handle.ewma_latency_ms == 0.0 {
                rtt_ms as f64
            } else {
                LATENCY_ALPHA * rtt_ms as f64 + (1.0 - LATENCY_ALPHA) * handle.ewma_latency_ms
            };
        }
    }

    /// Mark a handle degraded (outbound queue over its soft cap).
    pub(crate) fn degrade(&self, kind: WorkerKind) {
        if let Some(handle) = self.handles.write().get_mut(&kind) {
            handle.status = WorkerStatus::Degraded;
        }
    }

    /// Restore a degraded handle whose queue has drained.
    pub(crate) fn restore_if_drained(&self, kind: WorkerKind, threshold: usize) {
        let mut handles = self.handles.write();
        if let Some(handle) = handles.get_mut(&kind) {
            if handle.status == WorkerStatus::Degraded && handle.queue_depth() <= threshold {
                handle.status = if handle.inflight.is_empty() {
                    WorkerStatus::Idle
                } else {
                    WorkerStatus::Busy
                };
            }
        }
    }

    pub(crate) fn outbound(&self, kind: WorkerKind) -> Option<(HandleId, mpsc::Sender<Vec<u8>>)> {
        let handles = self.handles.read();
        handles.get(&kind).map(|h| (h.id, h.outbound.clone()))
    }

    /// Outbound senders of every handle currently accepting writes.
    pub(crate) fn broadcast_targets(&self) -> Vec<(WorkerKind, mpsc::Sender<Vec<u8>>)> {
        let handles = self.handles.read();
        handles
            .values()
            .filter(|h| h.status != WorkerStatus::Error)
            .map(|h| (h.kind, h.outbound.clone()))
            .collect()
    }

    /// Handles whose last heartbeat is older than `deadline_ms`.
    pub(crate) fn expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<(WorkerKind, HandleId)> {
        let handles = self.handles.read();
        handles
            .values()
            .filter(|h| now_ms.saturating_sub(h.last_heartbeat_ms) > timeout_ms)
            .map(|h| (h.kind, h.id))
            .collect()
    }

    pub fn contains(&self, kind: WorkerKind) -> bool {
        self.handles.read().contains_key(&kind)
    }

    pub fn list(&self) -> Vec<WorkerKind> {
        let mut kinds: Vec<_> = self.handles.read().keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    pub fn snapshot_health(&self) -> HashMap<WorkerKind, WorkerHealth> {
        let handles = self.handles.read();
        handles
            .iter()
            .map(|(kind, h)| {
                (
                    *kind,
                    WorkerHealth {
                        status: h.status,
                        queue_depth: h.inflight.len(),
                        last_heartbeat_ms: h.last_heartbeat_ms,
                        ewma_latency_ms: h.ewma_latency_ms,
                    },
                )
            })
            .collect()
    }

    /// Total in-flight tasks across all handles. Test and invariant
    /// checks only; dispatch paths use per-handle counts.
    pub fn total_inflight(&self) -> usize {
        self.handles.read().values().map(|h| h.inflight.len()).sum()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
