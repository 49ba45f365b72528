// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow runs against the in-process fake dispatcher.

use super::*;
use crate::runtime::Runtime;
use crew_broker::{FakeDispatcher, ScriptedReply};
use crew_core::test_support::ChangeEventBuilder;
use crew_core::{ApprovalConfig, BreakerConfig, CriticalOperation, FakeClock, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

fn runtime(
    fake: Arc<FakeDispatcher>,
) -> Arc<Runtime<FakeClock, FakeDispatcher>> {
    Runtime::builder(fake, FakeClock::new()).build()
}

fn register_core_workers(fake: &FakeDispatcher) {
    fake.register(WorkerKind::Quality);
    fake.register(WorkerKind::Synthesizer);
}

#[tokio::test]
async fn small_change_approves_with_all_contributions() {
    let fake = Arc::new(FakeDispatcher::new());
    register_core_workers(&fake);
    let rt = runtime(Arc::clone(&fake));

    let event = ChangeEventBuilder::new().files(3, 14).build();
    let result = rt.submit(event).await.unwrap();

    assert_eq!(result.decision, Decision::Approve);
    assert_eq!(result.contributions.len(), 2);
    assert!(result.contributions.iter().all(|c| c.status.is_success()));
    // Quality first, synthesizer last.
    let delivered = fake.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].target, WorkerKind::Quality);
    assert_eq!(delivered[1].target, WorkerKind::Synthesizer);
}

#[tokio::test]
async fn findings_downgrade_to_request_changes() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(WorkerKind::Quality, ScriptedReply::done(4));
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::RequestChanges);
    assert_eq!(result.totals.findings, 4);
}

#[tokio::test]
async fn worker_failure_downgrades_to_needs_work() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(WorkerKind::Quality, ScriptedReply::Fail { error: "analyzer crashed".into() });
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    let quality = result
        .contributions
        .iter()
        .find(|c| c.worker == WorkerKind::Quality)
        .unwrap();
    assert_eq!(quality.status, TaskStatus::Failed);
    assert_eq!(quality.error.as_deref(), Some("analyzer crashed"));
}

#[tokio::test]
async fn worker_timeout_is_noted_and_run_continues() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(WorkerKind::Security, ScriptedReply::Timeout);
    fake.register(WorkerKind::Quality);
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    // Manifest touch pulls in security.
    let event = ChangeEventBuilder::new().file("Cargo.lock", 30, 2).files(2, 8).build();
    let result = rt.submit(event).await.unwrap();

    assert_eq!(result.decision, Decision::NeedsWork);
    let security = result
        .contributions
        .iter()
        .find(|c| c.worker == WorkerKind::Security)
        .unwrap();
    assert_eq!(security.status, TaskStatus::Timeout);
    // The others still contributed; the synthesizer ran.
    let quality = result
        .contributions
        .iter()
        .find(|c| c.worker == WorkerKind::Quality)
        .unwrap();
    assert!(quality.status.is_success());
    assert!(fake.delivered().iter().any(|t| t.target == WorkerKind::Synthesizer));
}

#[tokio::test]
async fn synthesizer_receives_artifacts_of_successful_tasks() {
    let fake = Arc::new(FakeDispatcher::new());
    register_core_workers(&fake);
    let rt = runtime(Arc::clone(&fake));

    rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();

    let delivered = fake.delivered();
    let synth = delivered.iter().find(|t| t.target == WorkerKind::Synthesizer).unwrap();
    let artifacts = synth.config.get("artifacts").and_then(|v| v.as_array()).unwrap();
    assert_eq!(artifacts.len(), 1);
}

#[tokio::test]
async fn synthesizer_failure_yields_needs_work_with_reason() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Quality);
    fake.script(WorkerKind::Synthesizer, ScriptedReply::Fail { error: "llm quota".into() });
    let rt = runtime(Arc::clone(&fake));

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    let synth = result
        .contributions
        .iter()
        .find(|c| c.worker == WorkerKind::Synthesizer)
        .unwrap();
    assert_eq!(synth.error.as_deref(), Some("llm quota"));
}

#[tokio::test]
async fn open_synthesizer_breaker_downgrades_without_calling_it() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Quality);
    fake.script(WorkerKind::Synthesizer, ScriptedReply::Timeout);
    let rt = Runtime::builder(Arc::clone(&fake), FakeClock::new())
        .breaker(BreakerConfig { failure_threshold: 1, ..BreakerConfig::default() })
        .retry(RetryConfig { max_attempts: 1, ..RetryConfig::default() })
        .build();

    // First run trips the synthesizer breaker.
    let first = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(first.decision, Decision::NeedsWork);
    let synth_calls =
        fake.delivered().iter().filter(|t| t.target == WorkerKind::Synthesizer).count();
    assert_eq!(synth_calls, 1);

    // Second run: the breaker refuses fast, the synthesizer is never
    // called, and the verdict still downgrades.
    let second = rt.submit(ChangeEventBuilder::new().files(2, 9).build()).await.unwrap();
    assert_eq!(second.decision, Decision::NeedsWork);
    let synth_calls_after =
        fake.delivered().iter().filter(|t| t.target == WorkerKind::Synthesizer).count();
    assert_eq!(synth_calls_after, 1);
    assert_eq!(rt.health().breakers["synthesizer"].state, "open");
}

#[tokio::test(start_paused = true)]
async fn transient_synthesizer_failures_are_retried() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Quality);
    // Worker-timeout replies are transient from the retry policy's
    // point of view: each attempt re-delivers.
    fake.script(WorkerKind::Synthesizer, ScriptedReply::Timeout);
    let rt = Runtime::builder(Arc::clone(&fake), FakeClock::new())
        .retry(RetryConfig { max_attempts: 3, ..RetryConfig::default() })
        .build();

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    let synth_calls =
        fake.delivered().iter().filter(|t| t.target == WorkerKind::Synthesizer).count();
    assert_eq!(synth_calls, 3);
    // Three attempts, one terminal failure on the breaker.
    assert_eq!(rt.health().breakers["synthesizer"].failures, 1);
}

#[tokio::test]
async fn blocking_critical_issue_fails_the_gate() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Quality);
    fake.script(
        WorkerKind::Synthesizer,
        ScriptedReply::Done {
            findings: 0,
            results: serde_json::json!({
                "critical": [
                    { "severity": "critical", "description": "hardcoded credentials" },
                    { "severity": "low", "description": "typo" },
                ],
                "recommendations": ["rotate the key"],
            }),
            delay_ms: 0,
        },
    );
    let rt = runtime(Arc::clone(&fake));

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    assert_eq!(result.critical_issues, vec!["hardcoded credentials".to_string()]);
    assert_eq!(result.recommendations, vec!["rotate the key".to_string()]);
}

#[tokio::test]
async fn sub_blocking_criticals_do_not_fail_the_gate() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Quality);
    fake.script(
        WorkerKind::Synthesizer,
        ScriptedReply::Done {
            findings: 0,
            results: serde_json::json!({
                "critical": [ { "severity": "low", "description": "nit" } ],
            }),
            delay_ms: 0,
        },
    );
    let rt = runtime(Arc::clone(&fake));

    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::Approve);
    assert!(result.critical_issues.is_empty());
}

#[tokio::test]
async fn empty_registry_aborts_with_needs_work() {
    let fake = Arc::new(FakeDispatcher::new());
    let rt = runtime(Arc::clone(&fake));
    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    assert!(result.summary.contains("no workers available"));
    assert!(fake.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn parallel_collection_takes_max_not_sum_of_delays() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(
        WorkerKind::Security,
        ScriptedReply::Done { findings: 0, results: serde_json::json!({}), delay_ms: 300 },
    );
    fake.script(
        WorkerKind::Architecture,
        ScriptedReply::Done { findings: 0, results: serde_json::json!({}), delay_ms: 300 },
    );
    fake.script(
        WorkerKind::Quality,
        ScriptedReply::Done { findings: 0, results: serde_json::json!({}), delay_ms: 300 },
    );
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    // Manifest + large change: three analysis workers, parallel plan.
    let event = ChangeEventBuilder::new().file("Cargo.lock", 30, 2).files(12, 60).build();
    let started = tokio::time::Instant::now();
    let result = rt.submit(event).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.decision, Decision::Approve);
    // Three 300ms workers collected together, not back to back.
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
}

#[tokio::test]
async fn hybrid_groups_run_in_order() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.register(WorkerKind::Security);
    fake.register(WorkerKind::Quality);
    fake.register(WorkerKind::Architecture);
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    let event = ChangeEventBuilder::new().files(2, 8).build();
    let mut run = crew_core::RunState::new(crew_core::RunId::new(), 0);
    run.advance(crew_core::RunPhase::Dispatch).unwrap();
    let plan = crate::router::RoutePlan {
        workers: vec![WorkerKind::Security, WorkerKind::Quality, WorkerKind::Architecture],
        strategy: Strategy::Hybrid,
        groups: Some(vec![
            vec![WorkerKind::Security],
            vec![WorkerKind::Quality, WorkerKind::Architecture],
        ]),
        reasoning: "pinned".to_string(),
        confidence: 0.9,
        used_fallback: false,
    };
    let tasks: Vec<Task> = plan
        .workers
        .iter()
        .map(|kind| rt.build_task(*kind, run.run_id, &event))
        .collect();
    for task in &tasks {
        run.tasks.insert(task.id, RunTaskStatus::Pending);
    }

    let cancel = CancellationToken::new();
    let outcomes = rt.dispatch_and_collect(&mut run, &plan, tasks, &cancel).await.unwrap();
    assert_eq!(outcomes.len(), 3);

    // Security dispatched strictly before the second group.
    let delivered = fake.delivered();
    assert_eq!(delivered[0].target, WorkerKind::Security);
    let rest: Vec<WorkerKind> = delivered[1..].iter().map(|t| t.target).collect();
    assert!(rest.contains(&WorkerKind::Quality));
    assert!(rest.contains(&WorkerKind::Architecture));
}

#[tokio::test]
async fn shutdown_cancels_live_runs() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(WorkerKind::Quality, ScriptedReply::Silent);
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    let rt2 = Arc::clone(&rt);
    let run = tokio::spawn(async move {
        rt2.submit(ChangeEventBuilder::new().files(2, 8).build()).await
    });

    // Wait for the run to reach its silent worker.
    for _ in 0..100 {
        if rt.active_runs() == 1 && !fake.delivered().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    rt.shutdown();
    // Idempotent: cancelling again changes nothing.
    rt.shutdown();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    let quality = result
        .contributions
        .iter()
        .find(|c| c.worker == WorkerKind::Quality)
        .unwrap();
    assert_eq!(quality.status, TaskStatus::Cancelled);
    assert_eq!(rt.active_runs(), 0);
}

#[tokio::test]
async fn cancel_by_run_id_aborts_the_run() {
    let fake = Arc::new(FakeDispatcher::new());
    fake.script(WorkerKind::Quality, ScriptedReply::Silent);
    fake.register(WorkerKind::Synthesizer);
    let rt = runtime(Arc::clone(&fake));

    let rt2 = Arc::clone(&rt);
    let run = tokio::spawn(async move {
        rt2.submit(ChangeEventBuilder::new().files(2, 8).build()).await
    });

    let run_id = loop {
        if let Some(id) = rt.run_ids().first().copied() {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };

    assert!(rt.cancel(run_id));
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
    // The finished run is gone; cancelling again reports false.
    assert!(!rt.cancel(run_id));
}

#[tokio::test(start_paused = true)]
async fn gated_branch_suspends_until_second_approval() {
    let fake = Arc::new(FakeDispatcher::new());
    register_core_workers(&fake);

    let approval = ApprovalConfig {
        critical_operations: vec![CriticalOperation {
            kind: "production_release".to_string(),
            required_approvals: 2,
            timeout_ms: 300_000,
            required_roles: vec!["admin".to_string(), "ops".to_string()],
            conditions: {
                let mut map = serde_json::Map::new();
                map.insert("branch".to_string(), serde_json::json!("release/*"));
                map
            },
        }],
        ..ApprovalConfig::default()
    };
    let rt = Runtime::builder(Arc::clone(&fake), FakeClock::new())
        .approval(approval)
        .build();

    let captured: Arc<parking_lot::Mutex<Option<crate::approval::ApprovalId>>> =
        Arc::default();
    let sink = Arc::clone(&captured);
    rt.gate().set_notifier(Box::new(move |event, request| {
        if event == "request_created" {
            *sink.lock() = Some(request.id);
        }
    }));

    let rt2 = Arc::clone(&rt);
    let run = tokio::spawn(async move {
        rt2.submit(ChangeEventBuilder::new().branch("release/2026-08").files(2, 8).build())
            .await
    });

    let request_id = loop {
        if let Some(id) = *captured.lock() {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    // One approval is not enough.
    rt.gate().approve(request_id, "u1", "admin", "lgtm").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());

    rt.gate().approve(request_id, "u2", "ops", "ship").unwrap();
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.decision, Decision::Approve);
}

#[tokio::test(start_paused = true)]
async fn gated_branch_rejection_yields_needs_work() {
    let fake = Arc::new(FakeDispatcher::new());
    register_core_workers(&fake);

    let approval = ApprovalConfig {
        critical_operations: vec![CriticalOperation {
            kind: "production_release".to_string(),
            required_approvals: 2,
            timeout_ms: 300_000,
            required_roles: vec![],
            conditions: {
                let mut map = serde_json::Map::new();
                map.insert("branch".to_string(), serde_json::json!("release/*"));
                map
            },
        }],
        ..ApprovalConfig::default()
    };
    let rt = Runtime::builder(Arc::clone(&fake), FakeClock::new())
        .approval(approval)
        .build();

    let captured: Arc<parking_lot::Mutex<Option<crate::approval::ApprovalId>>> =
        Arc::default();
    let sink = Arc::clone(&captured);
    rt.gate().set_notifier(Box::new(move |event, request| {
        if event == "request_created" {
            *sink.lock() = Some(request.id);
        }
    }));

    let rt2 = Arc::clone(&rt);
    let run = tokio::spawn(async move {
        rt2.submit(ChangeEventBuilder::new().branch("release/2026-08").files(2, 8).build())
            .await
    });

    let request_id = loop {
        if let Some(id) = *captured.lock() {
            break id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    rt.gate().reject(request_id, "u1", "admin", "not during freeze").unwrap();
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.decision, Decision::NeedsWork);
}

#[tokio::test]
async fn warnings_fire_when_budgets_are_exceeded() {
    let fake = Arc::new(FakeDispatcher::new());
    register_core_workers(&fake);
    let rt = Runtime::builder(Arc::clone(&fake), FakeClock::new())
        .workflow(crew_core::WorkflowConfig {
            token_budget_warn: 100,
            ..crew_core::WorkflowConfig::default()
        })
        .build();

    // Each fake task reports 1000 tokens.
    let result = rt.submit(ChangeEventBuilder::new().files(2, 8).build()).await.unwrap();
    assert!(result.warnings.iter().any(|w| w.contains("token budget")));
}
