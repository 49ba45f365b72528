// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker socket server.
//!
//! The accept loop runs in a spawned task and handles each connection
//! without blocking the engine. A connection must authenticate with its
//! first frame, then register; after that the read loop correlates
//! responses, heartbeats, and pongs until the connection dies or the
//! handle is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crew_core::{
    BrokerConfig, Clock, OrchestratorError, TaskId, TaskResult, WorkerHealth, WorkerKind,
};
use crew_wire::{read_frame_timeout, AuthData, Envelope, MessageKind, RegistrationData, WireError};

use crate::auth::{self, AuthLimiter};
use crate::registry::{AgentRegistry, HandleId};

/// Agent name the broker stamps on frames it originates.
pub const BROKER_AGENT: &str = "broker";

/// A task future waiting on its worker's response.
pub(crate) struct Pending {
    pub tx: oneshot::Sender<Result<TaskResult, OrchestratorError>>,
    pub kind: WorkerKind,
    pub handle: HandleId,
}

/// The IPC broker. One per daemon; shared behind `Arc`.
pub struct Broker<C: Clock> {
    pub(crate) config: BrokerConfig,
    pub(crate) clock: C,
    secret: String,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) pending: Mutex<HashMap<TaskId, Pending>>,
    limiter: Mutex<AuthLimiter>,
    pub(crate) cancel: CancellationToken,
    connections: AtomicUsize,
}

impl<C: Clock> Broker<C> {
    pub fn new(config: BrokerConfig, secret: impl Into<String>, clock: C) -> Arc<Self> {
        let limiter = AuthLimiter::new(config.auth_window_ms, config.max_auth_attempts);
        Arc::new(Self {
            config,
            clock,
            secret: secret.into(),
            registry: Arc::new(AgentRegistry::new()),
            pending: Mutex::new(HashMap::new()),
            limiter: Mutex::new(limiter),
            cancel: CancellationToken::new(),
            connections: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Completes when the broker has been shut down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn snapshot_health(&self) -> HashMap<WorkerKind, WorkerHealth> {
        self.registry.snapshot_health()
    }

    /// Stop accepting, tear down every connection, and fail all
    /// outstanding task futures with `Cancelled`.
    pub fn shutdown(&self) {
        info!("broker shutting down");
        self.cancel.cancel();
        let pending: Vec<(TaskId, Pending)> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };
        for (task_id, p) in pending {
            self.registry.release(p.kind, &task_id);
            let _ = p.tx.send(Err(OrchestratorError::Cancelled));
        }
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("accept loop stopped");
                    return;
                }
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                            warn!("connection limit reached, dropping connection");
                            continue;
                        }
                        let broker = Arc::clone(&self);
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            broker.handle_connection(reader, writer).await;
                        });
                    }
                    Err(e) => error!("accept error: {}", e),
                },
            }
        }
    }

    /// Drive one connection from handshake to teardown.
    ///
    /// Generic over the stream halves so tests can use in-memory pipes.
    pub async fn handle_connection<R, W>(self: Arc<Self>, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.connections.fetch_add(1, Ordering::Relaxed);
        let mut reader = BufReader::new(reader);

        let outcome = self.handshake(&mut reader).await;
        let (kind, pid) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                debug!(error = %err, "handshake failed, destroying stream");
                self.connections.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        // Install the handle; a displaced registration of the same
        // identity is destroyed and its task futures failed.
        let conn_cancel = self.cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_cap);
        let (handle_id, displaced) = self.registry.install(
            kind,
            pid,
            outbound_tx,
            conn_cancel.clone(),
            self.clock.epoch_ms(),
        );
        if let Some((old_id, old_tasks, old_cancel)) = displaced {
            warn!(worker = %kind, "re-registration displaced a live handle");
            old_cancel.cancel();
            self.fail_tasks(kind, old_id, &old_tasks, |k| {
                OrchestratorError::Transient(format!("worker {k} re-registered"))
            });
        }

        info!(worker = %kind, pid, "worker registered");
        self.broadcast(
            "worker_registered",
            serde_json::json!({ "agent": kind.as_str(), "pid": pid }),
        );

        // Writer task: drains the outbound queue onto the socket.
        let writer_cancel = conn_cancel.clone();
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, writer_cancel));

        self.read_loop(&mut reader, kind, handle_id, &conn_cancel).await;

        // Teardown: the handle may already be gone (sweep eviction or
        // re-registration); evict is a no-op then.
        conn_cancel.cancel();
        if let Some((tasks, _)) = self.registry.evict(kind, handle_id) {
            self.fail_tasks(kind, handle_id, &tasks, |k| {
                OrchestratorError::Transient(format!("worker {k} disconnected"))
            });
            self.broadcast(
                "worker_evicted",
                serde_json::json!({ "agent": kind.as_str(), "reason": "disconnected" }),
            );
        }
        let _ = writer_task.await;
        self.connections.fetch_sub(1, Ordering::Relaxed);
        info!(worker = %kind, "connection closed");
    }

    /// First frame must be `auth`, second `registration`, both within
    /// the handshake window. Anything else destroys the stream.
    async fn handshake<R>(
        &self,
        reader: &mut BufReader<R>,
    ) -> Result<(WorkerKind, u32), OrchestratorError>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        let first = read_frame_timeout(reader, timeout).await.map_err(wire_violation)?;
        if first.kind != MessageKind::Auth {
            return Err(OrchestratorError::ProtocolViolation(format!(
                "expected auth frame, got {:?}",
                first.kind
            )));
        }
        let auth: AuthData = first
            .data_as()
            .map_err(|e| OrchestratorError::ProtocolViolation(format!("bad auth payload: {e}")))?;

        let now_ms = self.clock.epoch_ms();
        {
            let mut limiter = self.limiter.lock();
            if limiter.is_disqualified(&auth.agent_id, now_ms) {
                // Rejected before any token comparison.
                warn!(agent = %auth.agent_id, "auth rate limit exceeded");
                return Err(OrchestratorError::AuthenticationFailed(
                    "too many failed attempts".to_string(),
                ));
            }
        }

        let kind = match auth::verify(&self.config, &self.secret, &auth.token, &auth.agent_id) {
            Ok(kind) => {
                self.limiter.lock().record_success(&auth.agent_id);
                kind
            }
            Err(err) => {
                warn!(agent = %auth.agent_id, error = %err, "authentication failed");
                self.limiter.lock().record_failure(&auth.agent_id, now_ms);
                return Err(err);
            }
        };

        let second = read_frame_timeout(reader, timeout).await.map_err(wire_violation)?;
        if second.kind != MessageKind::Registration {
            return Err(OrchestratorError::ProtocolViolation(format!(
                "expected registration frame, got {:?}",
                second.kind
            )));
        }
        let registration: RegistrationData = second.data_as().map_err(|e| {
            OrchestratorError::ProtocolViolation(format!("bad registration payload: {e}"))
        })?;

        Ok((kind, registration.pid))
    }

    /// Read frames until the connection dies or is cancelled.
    async fn read_loop<R>(
        &self,
        reader: &mut BufReader<R>,
        kind: WorkerKind,
        handle_id: HandleId,
        cancel: &CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = crew_wire::read_frame(reader) => frame,
            };
            let envelope = match frame {
                Ok(envelope) => envelope,
                Err(WireError::ConnectionClosed) => {
                    debug!(worker = %kind, "worker stream closed");
                    return;
                }
                Err(err) => {
                    // Framing errors destroy the stream.
                    warn!(worker = %kind, error = %err, "protocol violation");
                    return;
                }
            };
            match envelope.kind {
                MessageKind::Heartbeat => {
                    self.registry.heartbeat(kind, self.clock.epoch_ms());
                }
                MessageKind::Task => self.complete_response(kind, handle_id, envelope),
                MessageKind::Pong => self.record_pong(kind, &envelope),
                MessageKind::Ping => self.answer_ping(kind, envelope),
                MessageKind::Event => {
                    debug!(worker = %kind, id = %envelope.id, "worker event");
                }
                MessageKind::Auth | MessageKind::Registration => {
                    warn!(worker = %kind, "unexpected handshake frame mid-stream");
                    return;
                }
            }
        }
    }

    fn record_pong(&self, kind: WorkerKind, envelope: &Envelope) {
        if let Some(sent_ms) = envelope.data.get("sent_ms").and_then(|v| v.as_u64()) {
            let rtt = self.clock.epoch_ms().saturating_sub(sent_ms);
            self.registry.record_latency(kind, rtt);
        }
    }

    fn answer_ping(&self, kind: WorkerKind, envelope: Envelope) {
        let pong = Envelope::new(
            envelope.id,
            MessageKind::Pong,
            BROKER_AGENT,
            self.clock.timestamp(),
            envelope.data,
        );
        if let Some((_, outbound)) = self.registry.outbound(kind) {
            if let Ok(bytes) = crew_wire::encode(&pong) {
                let _ = outbound.try_send(bytes);
            }
        }
    }

    pub(crate) fn new_envelope(&self, kind: MessageKind, data: serde_json::Value) -> Envelope {
        Envelope::new(
            format!("msg-{}", nanoid::nanoid!(12)),
            kind,
            BROKER_AGENT,
            self.clock.timestamp(),
            data,
        )
    }
}

fn wire_violation(err: WireError) -> OrchestratorError {
    match err {
        WireError::Timeout => {
            OrchestratorError::ProtocolViolation("handshake timed out".to_string())
        }
        other => OrchestratorError::ProtocolViolation(other.to_string()),
    }
}

/// Drain encoded frames onto the socket until cancelled or the peer
/// stops reading.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return,
            bytes = outbound.recv() => match bytes {
                Some(bytes) => bytes,
                None => return,
            },
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "write failed, closing connection");
            cancel.cancel();
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!(error = %e, "flush failed, closing connection");
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
