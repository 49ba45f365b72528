// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process fake dispatcher for engine and workflow tests.

use async_trait::async_trait;
use crew_core::{
    OrchestratorError, Task, TaskKpis, TaskResult, TaskStatus, WorkerHealth, WorkerKind,
    WorkerStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapter::DispatchAdapter;

/// Scripted behavior for one worker kind.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Respond `done` after `delay_ms`, reporting `findings`.
    Done { findings: u64, results: serde_json::Value, delay_ms: u64 },
    /// Respond with a failed task result.
    Fail { error: String },
    /// Resolve with a worker-timeout error.
    Timeout,
    /// Never respond; resolves only through cancellation.
    Silent,
    /// Refuse delivery outright.
    Unavailable,
}

impl ScriptedReply {
    pub fn done(findings: u64) -> Self {
        ScriptedReply::Done {
            findings,
            results: serde_json::json!({ "findings": findings }),
            delay_ms: 0,
        }
    }
}

/// Fake [`DispatchAdapter`] with per-kind scripted replies.
#[derive(Default)]
pub struct FakeDispatcher {
    replies: Mutex<HashMap<WorkerKind, ScriptedReply>>,
    health: Mutex<HashMap<WorkerKind, WorkerHealth>>,
    delivered: Mutex<Vec<Task>>,
    broadcasts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind` as a healthy idle worker answering `done` with
    /// zero findings.
    pub fn register(&self, kind: WorkerKind) -> &Self {
        self.script(kind, ScriptedReply::done(0))
    }

    pub fn script(&self, kind: WorkerKind, reply: ScriptedReply) -> &Self {
        self.replies.lock().insert(kind, reply);
        self.health.lock().insert(
            kind,
            WorkerHealth {
                status: WorkerStatus::Idle,
                queue_depth: 0,
                last_heartbeat_ms: 0,
                ewma_latency_ms: 1.0,
            },
        );
        self
    }

    pub fn set_health(&self, kind: WorkerKind, health: WorkerHealth) -> &Self {
        self.health.lock().insert(kind, health);
        self
    }

    pub fn remove(&self, kind: WorkerKind) {
        self.replies.lock().remove(&kind);
        self.health.lock().remove(&kind);
    }

    /// Tasks delivered so far, in order.
    pub fn delivered(&self) -> Vec<Task> {
        self.delivered.lock().clone()
    }

    pub fn broadcasts(&self) -> Vec<(String, serde_json::Value)> {
        self.broadcasts.lock().clone()
    }
}

#[async_trait]
impl DispatchAdapter for FakeDispatcher {
    async fn deliver(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let kind = task.target;
        let reply = self.replies.lock().get(&kind).cloned();
        self.delivered.lock().push(task.clone());
        match reply {
            None | Some(ScriptedReply::Unavailable) => {
                Err(OrchestratorError::WorkerUnavailable(kind))
            }
            Some(ScriptedReply::Timeout) => Err(OrchestratorError::WorkerTimeout(kind)),
            Some(ScriptedReply::Silent) => {
                cancel.cancelled().await;
                Err(OrchestratorError::Cancelled)
            }
            Some(ScriptedReply::Fail { error }) => Ok(TaskResult {
                task_id: task.id,
                status: TaskStatus::Failed,
                artifacts: Vec::new(),
                results: serde_json::Value::Null,
                kpis: TaskKpis::default(),
                error: Some(error),
            }),
            Some(ScriptedReply::Done { findings, results, delay_ms }) => {
                if delay_ms > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
                Ok(TaskResult {
                    task_id: task.id,
                    status: TaskStatus::Done,
                    artifacts: vec![task.output.clone()],
                    results,
                    kpis: TaskKpis { latency_ms: delay_ms.max(5), tokens: 1_000, findings },
                    error: None,
                })
            }
        }
    }

    fn broadcast(&self, name: &str, payload: serde_json::Value) {
        self.broadcasts.lock().push((name.to_string(), payload));
    }

    fn snapshot_health(&self) -> HashMap<WorkerKind, WorkerHealth> {
        self.health.lock().clone()
    }
}

/// A scripted worker process-stand-in: connects to a broker socket,
/// authenticates, registers, heartbeats, and answers task frames per
/// its script. Used by end-to-end scenario tests.
pub struct ScriptedWorker {
    cancel: CancellationToken,
    quiet: std::sync::Arc<std::sync::atomic::AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl ScriptedWorker {
    pub async fn spawn(
        socket: &std::path::Path,
        kind: WorkerKind,
        token: &str,
        reply: ScriptedReply,
    ) -> std::io::Result<Self> {
        use crew_wire::{Envelope, MessageKind};
        use tokio::io::BufReader;

        let stream = tokio::net::UnixStream::connect(socket).await?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let agent = kind.as_str().to_string();

        let auth = Envelope::new(
            "msg-auth",
            MessageKind::Auth,
            agent.clone(),
            "2026-01-01T00:00:00+00:00",
            serde_json::json!({ "token": token, "agent_id": agent }),
        );
        crew_wire::write_frame(&mut write, &auth).await.map_err(io_err)?;
        let registration = Envelope::new(
            "msg-reg",
            MessageKind::Registration,
            agent.clone(),
            "2026-01-01T00:00:00+00:00",
            serde_json::json!({ "pid": std::process::id() }),
        );
        crew_wire::write_frame(&mut write, &registration).await.map_err(io_err)?;

        let cancel = CancellationToken::new();
        let quiet = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let loop_cancel = cancel.clone();
        let loop_quiet = std::sync::Arc::clone(&quiet);
        let task = tokio::spawn(async move {
            use std::sync::atomic::Ordering;
            let mut heartbeat = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = heartbeat.tick() => {
                        if loop_quiet.load(Ordering::Relaxed) {
                            continue;
                        }
                        let beat = Envelope::new(
                            format!("hb-{}", nanoid::nanoid!(8)),
                            MessageKind::Heartbeat,
                            agent.clone(),
                            "2026-01-01T00:00:00+00:00",
                            serde_json::Value::Null,
                        );
                        if crew_wire::write_frame(&mut write, &beat).await.is_err() {
                            return;
                        }
                    }
                    frame = crew_wire::read_frame(&mut reader) => {
                        let Ok(envelope) = frame else { return };
                        if loop_quiet.load(Ordering::Relaxed) {
                            continue;
                        }
                        match envelope.kind {
                            MessageKind::Task => {
                                if matches!(reply, ScriptedReply::Silent) {
                                    continue;
                                }
                                let response = scripted_response(&envelope, &agent, &reply);
                                if crew_wire::write_frame(&mut write, &response).await.is_err() {
                                    return;
                                }
                            }
                            MessageKind::Ping => {
                                let pong = Envelope::new(
                                    envelope.id,
                                    MessageKind::Pong,
                                    agent.clone(),
                                    "2026-01-01T00:00:00+00:00",
                                    envelope.data,
                                );
                                if crew_wire::write_frame(&mut write, &pong).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });
        Ok(Self { cancel, quiet, task })
    }

    /// Stop heartbeating and answering while keeping the connection
    /// open, as a hung worker process would.
    pub fn silence(&self) {
        self.quiet.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Kill the worker: the connection drops mid-run.
    pub fn kill(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

fn io_err(e: crew_wire::WireError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

fn scripted_response(
    task: &crew_wire::Envelope,
    agent: &str,
    reply: &ScriptedReply,
) -> crew_wire::Envelope {
    use crew_wire::MessageKind;
    let data = match reply {
        ScriptedReply::Done { findings, results, .. } => serde_json::json!({
            "status": "done",
            "results": results,
            "kpis": { "latency_ms": 15, "tokens": 800, "findings": findings },
            "artifacts": [format!("/tmp/crew-reports/{agent}.json")],
        }),
        ScriptedReply::Fail { error } => serde_json::json!({
            "status": "failed",
            "error": error,
        }),
        // Timeout/Unavailable scripts never reach a live reply; answer
        // failed so misuse is visible in tests.
        _ => serde_json::json!({ "status": "failed", "error": "unscripted" }),
    };
    crew_wire::Envelope::new(
        task.id.clone(),
        MessageKind::Task,
        agent,
        "2026-01-01T00:00:00+00:00",
        data,
    )
}
