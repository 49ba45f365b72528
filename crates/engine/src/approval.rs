// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Two-party approval gate for critical operations.
//!
//! Operations in the configured critical list cannot proceed until
//! enough distinct approvers sign off. A request is terminal on its
//! first rejection, on reaching the approval threshold, or on expiry.
//! The waiter resolves successfully only when the request actually
//! reached `Approved`; rejection and expiry both surface `NotApproved`.

use crew_core::{ApprovalConfig, Clock, CriticalOperation, Id, IdTag, OrchestratorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Marker for the approval request id space.
pub enum ApprovalTag {}

impl IdTag for ApprovalTag {
    const PREFIX: &'static str = "apv-";
}

/// Identifier of one approval request.
pub type ApprovalId = Id<ApprovalTag>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// One recorded approval or rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub approver: String,
    pub role: String,
    pub at_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub kind: String,
    pub requester: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub required_approvals: u32,
    pub required_roles: Vec<String>,
    pub approvals: Vec<ApprovalVote>,
    pub rejections: Vec<ApprovalVote>,
    pub state: ApprovalState,
}

/// Notification hook invoked on request_approved / request_rejected /
/// request_expired. Wired to a broker broadcast by the daemon.
pub type ApprovalNotifier = Box<dyn Fn(&str, &ApprovalRequest) + Send + Sync>;

struct Entry {
    request: ApprovalRequest,
    notify: watch::Sender<ApprovalState>,
}

pub struct ApprovalGate<C: Clock> {
    config: ApprovalConfig,
    clock: C,
    requests: Mutex<HashMap<ApprovalId, Entry>>,
    notifier: Mutex<Option<ApprovalNotifier>>,
}

impl<C: Clock> ApprovalGate<C> {
    pub fn new(config: ApprovalConfig, clock: C) -> Self {
        Self { config, clock, requests: Mutex::new(HashMap::new()), notifier: Mutex::new(None) }
    }

    pub fn set_notifier(&self, notifier: ApprovalNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Whether `kind` with this payload needs sign-off. Auto-approval
    /// (non-production environments) bypasses the gate entirely.
    pub fn requires_approval(
        &self,
        kind: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        if self.config.auto_approve {
            return false;
        }
        self.operation(kind).is_some_and(|op| conditions_match(&op.conditions, payload))
    }

    fn operation(&self, kind: &str) -> Option<&CriticalOperation> {
        self.config.critical_operations.iter().find(|op| op.kind == kind)
    }

    /// Open a request for a critical operation.
    pub fn create_request(
        &self,
        kind: &str,
        payload: serde_json::Map<String, serde_json::Value>,
        requester: &str,
    ) -> Result<ApprovalRequest, OrchestratorError> {
        let op = self.operation(kind).ok_or_else(|| {
            OrchestratorError::NotApproved(format!("unknown critical operation {kind:?}"))
        })?;
        let now_ms = self.clock.epoch_ms();
        let request = ApprovalRequest {
            id: ApprovalId::new(),
            kind: kind.to_string(),
            requester: requester.to_string(),
            payload,
            created_at_ms: now_ms,
            expires_at_ms: now_ms + op.timeout_ms,
            required_approvals: op.required_approvals,
            required_roles: op.required_roles.clone(),
            approvals: Vec::new(),
            rejections: Vec::new(),
            state: ApprovalState::Pending,
        };
        info!(id = %request.id, kind, requester, "approval request created");
        let (notify, _) = watch::channel(ApprovalState::Pending);
        self.requests.lock().insert(request.id, Entry { request: request.clone(), notify });
        self.emit("request_created", &request);
        Ok(request)
    }

    pub fn get(&self, id: ApprovalId) -> Option<ApprovalRequest> {
        self.requests.lock().get(&id).map(|e| e.request.clone())
    }

    /// Record an approval. Resolves the request when the threshold is
    /// reached.
    pub fn approve(
        &self,
        id: ApprovalId,
        approver: &str,
        role: &str,
        reason: &str,
    ) -> Result<ApprovalState, OrchestratorError> {
        let now_ms = self.clock.epoch_ms();
        let (state, fire) = {
            let mut requests = self.requests.lock();
            let entry = requests
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::NotApproved(format!("no request {id}")))?;
            let request = &mut entry.request;

            check_open(request, now_ms)?;
            if request.requester == approver && !self.config.allow_self_approval {
                return Err(OrchestratorError::NotApproved("self-approval is disabled".into()));
            }
            if !request.required_roles.is_empty()
                && !request.required_roles.iter().any(|r| r == role)
                && !self.config.emergency_override_roles.iter().any(|r| r == role)
            {
                return Err(OrchestratorError::NotApproved(format!(
                    "role {role:?} may not approve {}",
                    request.kind
                )));
            }
            if request.approvals.iter().any(|v| v.approver == approver) {
                return Err(OrchestratorError::NotApproved(format!(
                    "{approver} already approved"
                )));
            }

            request.approvals.push(ApprovalVote {
                approver: approver.to_string(),
                role: role.to_string(),
                at_ms: now_ms,
                reason: reason.to_string(),
            });

            let emergency =
                self.config.emergency_override_roles.iter().any(|r| r == role);
            if request.approvals.len() as u32 >= request.required_approvals || emergency {
                request.state = ApprovalState::Approved;
                let _ = entry.notify.send(ApprovalState::Approved);
                (ApprovalState::Approved, Some(("request_approved", request.clone())))
            } else {
                debug!(id = %id, have = request.approvals.len(), need = request.required_approvals,
                    "approval recorded, threshold not reached");
                (ApprovalState::Pending, None)
            }
        };
        if let Some((event, request)) = fire {
            info!(id = %id, "approval threshold reached");
            self.emit(event, &request);
        }
        Ok(state)
    }

    /// Record a rejection. Terminal on the first one.
    pub fn reject(
        &self,
        id: ApprovalId,
        approver: &str,
        role: &str,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let now_ms = self.clock.epoch_ms();
        let fire = {
            let mut requests = self.requests.lock();
            let entry = requests
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::NotApproved(format!("no request {id}")))?;
            let request = &mut entry.request;
            check_open(request, now_ms)?;

            request.rejections.push(ApprovalVote {
                approver: approver.to_string(),
                role: role.to_string(),
                at_ms: now_ms,
                reason: reason.to_string(),
            });
            request.state = ApprovalState::Rejected;
            let _ = entry.notify.send(ApprovalState::Rejected);
            request.clone()
        };
        warn!(id = %id, approver, reason, "approval request rejected");
        self.emit("request_rejected", &fire);
        Ok(())
    }

    /// Block until the request resolves, up to its expiry. Succeeds
    /// only when the final state is `Approved`.
    pub async fn wait(&self, id: ApprovalId) -> Result<(), OrchestratorError> {
        let (mut rx, expires_at_ms) = {
            let requests = self.requests.lock();
            let entry = requests
                .get(&id)
                .ok_or_else(|| OrchestratorError::NotApproved(format!("no request {id}")))?;
            (entry.notify.subscribe(), entry.request.expires_at_ms)
        };

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ApprovalState::Approved => return Ok(()),
                ApprovalState::Rejected => {
                    return Err(OrchestratorError::NotApproved("request rejected".into()))
                }
                ApprovalState::Expired => {
                    return Err(OrchestratorError::NotApproved("request expired".into()))
                }
                ApprovalState::Pending => {}
            }

            // Bounded wait: re-check against the wall clock so a fake
            // clock advancing past expiry is observed.
            let now_ms = self.clock.epoch_ms();
            if now_ms >= expires_at_ms {
                self.expire(id);
                continue;
            }
            let remaining = Duration::from_millis((expires_at_ms - now_ms).min(1_000));
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(OrchestratorError::NotApproved("gate dropped".into()));
                    }
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    fn expire(&self, id: ApprovalId) {
        let fire = {
            let mut requests = self.requests.lock();
            let Some(entry) = requests.get_mut(&id) else { return };
            if entry.request.state != ApprovalState::Pending {
                return;
            }
            entry.request.state = ApprovalState::Expired;
            let _ = entry.notify.send(ApprovalState::Expired);
            entry.request.clone()
        };
        warn!(id = %id, "approval request expired");
        self.emit("request_expired", &fire);
    }

    /// Expire every overdue pending request. Called from the daemon's
    /// minute tick.
    pub fn sweep_expired(&self) {
        let now_ms = self.clock.epoch_ms();
        let overdue: Vec<ApprovalId> = {
            let requests = self.requests.lock();
            requests
                .values()
                .filter(|e| {
                    e.request.state == ApprovalState::Pending && now_ms >= e.request.expires_at_ms
                })
                .map(|e| e.request.id)
                .collect()
        };
        for id in overdue {
            self.expire(id);
        }
    }

    fn emit(&self, event: &str, request: &ApprovalRequest) {
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier(event, request);
        }
    }
}

fn check_open(request: &ApprovalRequest, now_ms: u64) -> Result<(), OrchestratorError> {
    match request.state {
        ApprovalState::Pending if now_ms >= request.expires_at_ms => {
            Err(OrchestratorError::NotApproved("request expired".into()))
        }
        ApprovalState::Pending => Ok(()),
        other => Err(OrchestratorError::NotApproved(format!("request already {other:?}"))),
    }
}

/// Every condition key must appear in the payload and match; values
/// ending in `*` prefix-match.
fn conditions_match(
    conditions: &serde_json::Map<String, serde_json::Value>,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> bool {
    conditions.iter().all(|(key, want)| match payload.get(key) {
        Some(have) => match (want.as_str(), have.as_str()) {
            (Some(want), Some(have)) => match want.strip_suffix('*') {
                Some(prefix) => have.starts_with(prefix),
                None => want == have,
            },
            _ => want == have,
        },
        None => false,
    })
}

#[cfg(test)]
#[path = "approval_tests.rs"]
mod tests;
