// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The workflow state machine.
//!
//! ROUTE → DISPATCH → COLLECT → SYNTHESIZE → GATE → FINALIZE over one
//! [`RunState`]. Under the parallel strategy dispatch and collection
//! overlap: task futures are created as they are sent and awaited
//! together. Every broker call inherits the run's cancellation token.
//!
//! Failure semantics: a single send error fails that task and the run
//! continues; an evicted worker fails its tasks the same way; a
//! synthesizer failure (or an open synthesizer breaker) downgrades the
//! verdict to needs-work with the reason preserved. Fatal errors
//! surface unwrapped.

use crew_broker::DispatchAdapter;
use crew_core::{
    ChangeEvent, Clock, Decision, GateVerdict, OrchestratorError, RunId, RunPhase, RunState,
    RunTaskStatus, Severity, Task, TaskContext, TaskId, TaskResult, TaskStatus, WorkerContribution,
    WorkerKind, WorkflowResult,
};
use futures_util::future::join_all;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::{RoutePlan, Strategy};
use crate::runtime::Runtime;

/// The approval gate's operation kind for gated runs.
const RELEASE_OPERATION: &str = "production_release";

type TaskOutcome = (WorkerKind, TaskId, Result<TaskResult, OrchestratorError>);

impl<C: Clock, D: DispatchAdapter> Runtime<C, D> {
    /// Drive one change event through a full workflow run.
    pub async fn submit(&self, event: ChangeEvent) -> Result<WorkflowResult, OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let run_id = RunId::new();
        let cancel = self.cancel.child_token();
        self.runs.lock().insert(run_id, cancel.clone());
        let result = self.run_workflow(run_id, event, &cancel).await;
        self.runs.lock().remove(&run_id);
        result
    }

    async fn run_workflow(
        &self,
        run_id: RunId,
        event: ChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, OrchestratorError> {
        let started = self.clock.now();
        let mut run = RunState::new(run_id, self.clock.epoch_ms());

        // ROUTE
        let health = self.dispatcher.snapshot_health();
        let plan = self.router.route(&event, &health, self.clock.epoch_ms());
        info!(
            run = %run_id,
            workers = ?plan.workers,
            strategy = ?plan.strategy,
            confidence = plan.confidence,
            reasoning = %plan.reasoning,
            "routed"
        );
        if plan.workers.is_empty() {
            warn!(run = %run_id, "no routable workers");
            return Ok(self.empty_result(&run, "no workers available"));
        }
        run.selected = plan.workers.clone();

        // DISPATCH + COLLECT
        run.advance(RunPhase::Dispatch)?;
        let analysis: Vec<Task> = run
            .selected
            .iter()
            .copied()
            .filter(|kind| *kind != WorkerKind::Synthesizer)
            .map(|kind| self.build_task(kind, run_id, &event))
            .collect();
        let mut assigned: std::collections::HashMap<TaskId, WorkerKind> =
            analysis.iter().map(|t| (t.id, t.target)).collect();
        for task in &analysis {
            run.tasks.insert(task.id, RunTaskStatus::Pending);
        }
        let outcomes = self.dispatch_and_collect(&mut run, &plan, analysis, cancel).await?;
        for outcome in outcomes {
            self.absorb_outcome(&mut run, outcome)?;
        }

        // SYNTHESIZE
        run.advance(RunPhase::Synthesize)?;
        let synthesis = self.synthesize(&mut run, &mut assigned, &event, cancel).await?;

        // GATE
        run.advance(RunPhase::Gate)?;
        let verdict = self.gate_verdict(&mut run, &event, synthesis.as_ref(), cancel).await;
        run.verdict = Some(verdict.clone());

        // FINALIZE
        run.advance(RunPhase::Finalize)?;
        let duration_ms = self.clock.now().duration_since(started).as_millis() as u64;
        let result = self.finalize(&run, &assigned, synthesis.as_ref(), verdict, duration_ms);
        self.dispatcher.broadcast(
            "run_complete",
            serde_json::json!({
                "run": run_id.as_str(),
                "decision": result.decision,
                "findings": result.totals.findings,
            }),
        );
        info!(run = %run_id, decision = %result.decision, duration_ms, "run complete");
        Ok(result)
    }

    /// Send every analysis task per the plan's strategy and await all
    /// outcomes, each bounded by its own deadline.
    async fn dispatch_and_collect(
        &self,
        run: &mut RunState,
        plan: &RoutePlan,
        tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskOutcome>, OrchestratorError> {
        match plan.strategy {
            Strategy::Parallel => {
                // Dispatch and collection overlap: all futures run at
                // once and resolve independently.
                for task in &tasks {
                    run.tasks.insert(task.id, RunTaskStatus::Running);
                }
                run.advance(RunPhase::Collect)?;
                Ok(join_all(tasks.into_iter().map(|task| self.run_task(task, cancel))).await)
            }
            Strategy::Sequential => {
                run.advance(RunPhase::Collect)?;
                let mut outcomes = Vec::with_capacity(tasks.len());
                for task in tasks {
                    run.tasks.insert(task.id, RunTaskStatus::Running);
                    outcomes.push(self.run_task(task, cancel).await);
                }
                Ok(outcomes)
            }
            Strategy::Hybrid => {
                run.advance(RunPhase::Collect)?;
                // Outer groups run in order, members of a group together.
                let groups = match &plan.groups {
                    Some(groups) => groups.clone(),
                    None => vec![plan.workers.clone()],
                };
                let mut by_kind: std::collections::HashMap<WorkerKind, Task> =
                    tasks.into_iter().map(|t| (t.target, t)).collect();
                let mut outcomes = Vec::new();
                for group in groups {
                    let batch: Vec<Task> =
                        group.iter().filter_map(|kind| by_kind.remove(kind)).collect();
                    for task in &batch {
                        run.tasks.insert(task.id, RunTaskStatus::Running);
                    }
                    outcomes
                        .extend(join_all(batch.into_iter().map(|t| self.run_task(t, cancel))).await);
                }
                Ok(outcomes)
            }
        }
    }

    /// Deliver one task, bounded by twice its deadline. The deadline
    /// cancels the delivery cooperatively so the broker releases its
    /// correlation entry before the timeout surfaces.
    async fn run_task(&self, task: Task, cancel: &CancellationToken) -> TaskOutcome {
        let kind = task.target;
        let task_id = task.id;
        let deadline = std::time::Duration::from_millis(task.deadline_ms.saturating_mul(2));
        let attempt_cancel = cancel.child_token();
        let deliver = self.dispatcher.deliver(task, &attempt_cancel);
        tokio::pin!(deliver);
        let result = tokio::select! {
            result = &mut deliver => result,
            _ = tokio::time::sleep(deadline) => {
                attempt_cancel.cancel();
                let _ = deliver.await;
                Err(OrchestratorError::WorkerTimeout(kind))
            }
        };
        (kind, task_id, result)
    }

    /// Fold one task outcome into run state. Fatal errors abort.
    fn absorb_outcome(
        &self,
        run: &mut RunState,
        (kind, task_id, outcome): TaskOutcome,
    ) -> Result<(), OrchestratorError> {
        match outcome {
            Ok(result) => {
                debug!(run = %run.run_id, worker = %kind, task = %task_id, status = ?result.status, "collected");
                run.record_result(result)?;
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(run = %run.run_id, worker = %kind, task = %task_id, error = %err, "task failed");
                let status = match &err {
                    OrchestratorError::Cancelled => TaskStatus::Cancelled,
                    OrchestratorError::WorkerTimeout(_) => TaskStatus::Timeout,
                    _ => TaskStatus::Failed,
                };
                run.record_result(TaskResult::terminal(task_id, status, err.to_string()))?;
                run.errors.push(err);
            }
        }
        Ok(())
    }

    /// Run the synthesizer over the collected artifacts, wrapped in its
    /// named breaker. Returns the synthesizer's result when it ran.
    async fn synthesize(
        &self,
        run: &mut RunState,
        assigned: &mut std::collections::HashMap<TaskId, WorkerKind>,
        event: &ChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskResult>, OrchestratorError> {
        if !run.selected.contains(&WorkerKind::Synthesizer) {
            warn!(run = %run.run_id, "synthesizer not selected, skipping synthesis");
            return Ok(None);
        }

        let artifacts: Vec<String> = run
            .results
            .iter()
            .filter(|r| r.status.is_success())
            .flat_map(|r| r.artifacts.iter().map(|p| p.to_string_lossy().into_owned()))
            .collect();

        let mut task = self.build_task(WorkerKind::Synthesizer, run.run_id, event);
        task.config.insert("artifacts".to_string(), serde_json::json!(artifacts));
        let task_id = task.id;
        assigned.insert(task_id, WorkerKind::Synthesizer);
        run.tasks.insert(task_id, RunTaskStatus::Running);

        // Retries stay inside one breaker observation: transient
        // synthesis failures back off and re-deliver, and only the
        // terminal outcome counts toward the failure window.
        let breaker = self.breakers.get_or_create("synthesizer");
        let outcome = breaker
            .execute_with_retry(&self.retry, cancel, || self.run_task_result(task.clone(), cancel))
            .await;

        match outcome {
            Ok(result) => {
                run.record_result(result.clone())?;
                Ok(Some(result))
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(run = %run.run_id, error = %err, "synthesis failed");
                let status = match &err {
                    OrchestratorError::Cancelled => TaskStatus::Cancelled,
                    OrchestratorError::WorkerTimeout(_) => TaskStatus::Timeout,
                    _ => TaskStatus::Failed,
                };
                run.record_result(TaskResult::terminal(task_id, status, err.to_string()))?;
                run.errors.push(err);
                Ok(None)
            }
        }
    }

    /// `run_task` flattened for the breaker: a worker-reported failure
    /// still counts as a completed call.
    async fn run_task_result(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, OrchestratorError> {
        let (_, _, result) = self.run_task(task, cancel).await;
        result
    }

    /// Compute the verdict, consulting the approval gate for runs that
    /// match a critical operation.
    async fn gate_verdict(
        &self,
        run: &mut RunState,
        event: &ChangeEvent,
        synthesis: Option<&TaskResult>,
        _cancel: &CancellationToken,
    ) -> GateVerdict {
        let mut reasons = Vec::new();
        let mut warnings = Vec::new();

        let cancelled = run.errors.iter().any(|e| e.is_cancelled());
        let synth_ok = synthesis.is_some_and(|r| r.status.is_success());
        let failures: Vec<&TaskResult> =
            run.results.iter().filter(|r| !r.status.is_success()).collect();
        for failure in &failures {
            reasons.push(match &failure.error {
                Some(error) => format!("task {} {:?}: {error}", failure.task_id, failure.status),
                None => format!("task {} {:?}", failure.task_id, failure.status),
            });
        }
        if !synth_ok && !reasons.iter().any(|r| r.contains("synthes")) {
            reasons.push("synthesis missing".to_string());
        }

        let blocking = synthesis
            .map(|r| self.blocking_issues(r))
            .unwrap_or_default();
        for issue in &blocking {
            reasons.push(format!("blocking issue: {issue}"));
        }

        if run.totals.tokens > self.config.token_budget_warn {
            warnings.push(format!(
                "token budget exceeded: {} > {}",
                run.totals.tokens, self.config.token_budget_warn
            ));
        }
        if run.totals.latency_ms > self.config.latency_budget_warn_ms {
            warnings.push(format!(
                "latency budget exceeded: {}ms > {}ms",
                run.totals.latency_ms, self.config.latency_budget_warn_ms
            ));
        }

        let mut decision = if cancelled || !failures.is_empty() || !synth_ok || !blocking.is_empty()
        {
            Decision::NeedsWork
        } else if run.totals.findings > 0 {
            Decision::RequestChanges
        } else {
            Decision::Approve
        };

        // Two-party approval for gated branches (production releases).
        let mut payload = serde_json::Map::new();
        payload.insert("branch".to_string(), serde_json::json!(event.branch));
        payload.insert("repo".to_string(), serde_json::json!(event.repo));
        if self.gate.requires_approval(RELEASE_OPERATION, &payload) {
            match self.await_release_approval(run.run_id, payload, event).await {
                Ok(()) => {
                    debug!(run = %run.run_id, "release approved");
                }
                Err(err) => {
                    warn!(run = %run.run_id, error = %err, "release not approved");
                    reasons.push(err.to_string());
                    run.errors.push(err);
                    decision = Decision::NeedsWork;
                }
            }
        }

        GateVerdict { decision, reasons, warnings }
    }

    async fn await_release_approval(
        &self,
        run_id: RunId,
        payload: serde_json::Map<String, serde_json::Value>,
        event: &ChangeEvent,
    ) -> Result<(), OrchestratorError> {
        let request = self.gate.create_request(RELEASE_OPERATION, payload, &event.author)?;
        info!(run = %run_id, request = %request.id, "suspending at gate for approval");
        self.gate.wait(request.id).await
    }

    fn blocking_issues(&self, synthesis: &TaskResult) -> Vec<String> {
        let Some(critical) = synthesis.results.get("critical").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        critical
            .iter()
            .filter_map(|entry| {
                // Entries are either plain strings (assumed blocking) or
                // `{severity, description}` objects checked against the
                // configured threshold.
                if let Some(text) = entry.as_str() {
                    return Some(text.to_string());
                }
                let severity = entry
                    .get("severity")
                    .and_then(|s| s.as_str())
                    .and_then(|s| Severity::from_str(s).ok())
                    .unwrap_or(Severity::Critical);
                if severity >= self.config.blocking_severity {
                    Some(
                        entry
                            .get("description")
                            .and_then(|d| d.as_str())
                            .unwrap_or("unspecified critical issue")
                            .to_string(),
                    )
                } else {
                    None
                }
            })
            .collect()
    }

    fn finalize(
        &self,
        run: &RunState,
        assigned: &std::collections::HashMap<TaskId, WorkerKind>,
        synthesis: Option<&TaskResult>,
        verdict: GateVerdict,
        duration_ms: u64,
    ) -> WorkflowResult {
        let contributions: Vec<WorkerContribution> = run
            .selected
            .iter()
            .map(|kind| contribution_for(run, assigned, *kind))
            .collect();

        let critical_issues = synthesis.map(|r| self.blocking_issues(r)).unwrap_or_default();
        let recommendations = synthesis
            .and_then(|r| r.results.get("recommendations").and_then(|v| v.as_array()).cloned())
            .map(|entries| {
                entries.iter().filter_map(|e| e.as_str().map(str::to_string)).collect()
            })
            .unwrap_or_default();

        let failed = contributions.iter().filter(|c| !c.status.is_success()).count();
        let summary = format!(
            "{} of {} workers reported, {} findings, decision: {}",
            contributions.len() - failed,
            contributions.len(),
            run.totals.findings,
            verdict.decision,
        );

        WorkflowResult {
            run_id: run.run_id,
            decision: verdict.decision,
            summary,
            critical_issues,
            recommendations,
            contributions,
            totals: run.totals,
            warnings: verdict.warnings,
            duration_ms,
        }
    }

    fn empty_result(&self, run: &RunState, reason: &str) -> WorkflowResult {
        WorkflowResult {
            run_id: run.run_id,
            decision: Decision::NeedsWork,
            summary: format!("run aborted: {reason}"),
            critical_issues: vec![reason.to_string()],
            recommendations: Vec::new(),
            contributions: Vec::new(),
            totals: run.totals,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    fn build_task(&self, kind: WorkerKind, run_id: RunId, event: &ChangeEvent) -> Task {
        Task {
            id: TaskId::new(),
            target: kind,
            scope: event.files.iter().map(|f| f.path.clone()).collect(),
            context: TaskContext {
                repo_root: std::path::PathBuf::from(&event.repo),
                commit: event.commit.clone(),
                branch: event.branch.clone(),
            },
            output: self
                .config
                .reports_dir
                .join(run_id.as_str())
                .join(format!("{kind}.json")),
            config: serde_json::Map::new(),
            deadline_ms: self.config.task_timeout_ms(kind),
        }
    }
}

/// Per-worker section of the final result, matched back through the
/// run's task assignment.
fn contribution_for(
    run: &RunState,
    assigned: &std::collections::HashMap<TaskId, WorkerKind>,
    kind: WorkerKind,
) -> WorkerContribution {
    let result = run
        .results
        .iter()
        .find(|r| assigned.get(&r.task_id) == Some(&kind));
    match result {
        Some(result) => WorkerContribution {
            worker: kind,
            status: result.status,
            artifacts: result.artifacts.clone(),
            kpis: result.kpis,
            error: result.error.clone(),
        },
        None => WorkerContribution {
            worker: kind,
            status: TaskStatus::Failed,
            artifacts: Vec::new(),
            kpis: Default::default(),
            error: Some("no contribution recorded".to_string()),
        },
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
