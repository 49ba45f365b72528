// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle: socket binding, background sweeps, signals, and
//! graceful drain.

use crew_broker::{Broker, ConnectionPool, BROKER_AGENT};
use crew_core::{Clock, SystemClock};
use crew_engine::Runtime;
use crew_wire::{Envelope, EventData, MessageKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::env;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot determine state directory (HOME unset)")]
    NoStateDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad config {0}: {1}")]
    BadConfig(PathBuf, String),

    #[error("peer {0:?}: {1}")]
    BadPeer(String, String),

    #[error("daemon already running on {0}")]
    AlreadyRunning(PathBuf),
}

/// A running daemon: broker, runtime, peer pools, background sweeps.
pub struct Daemon {
    broker: Arc<Broker<SystemClock>>,
    runtime: Arc<Runtime<SystemClock, Broker<SystemClock>>>,
    peer_pools: Vec<Arc<ConnectionPool<SystemClock>>>,
    socket_path: PathBuf,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Bind the socket and bring the full stack up.
    pub async fn start(mut config: DaemonConfig) -> Result<Daemon, LifecycleError> {
        let state_dir = env::state_dir()?;
        std::fs::create_dir_all(&state_dir)?;

        let socket_path = match env::socket_path() {
            Some(path) => path,
            None if config.broker.socket_path.is_absolute() => config.broker.socket_path.clone(),
            None => state_dir.join("crewd.sock"),
        };
        config.broker.socket_path = socket_path.clone();
        std::fs::create_dir_all(&config.workflow.reports_dir)?;

        reclaim_stale_socket(&socket_path).await?;

        let secret = match env::auth_token() {
            Some(token) => token,
            None => {
                let token = nanoid::nanoid!(32);
                warn!("CREW_AUTH_TOKEN unset; generated a process-local secret");
                token
            }
        };

        let clock = SystemClock;
        let broker = Broker::new(config.broker.clone(), secret, clock.clone());
        let listener = tokio::net::UnixListener::bind(&socket_path)?;
        info!(socket = %socket_path.display(), "listening");
        tokio::spawn(Arc::clone(&broker).serve(listener));
        broker.spawn_sweeper();

        let runtime = Runtime::builder(Arc::clone(&broker), clock.clone())
            .workflow(config.workflow.clone())
            .router(config.router.clone())
            .breaker(config.breaker.clone())
            .retry(config.retry.clone())
            .approval(config.approval.clone())
            .build();

        // Outbound peer pools: warmed now, surfaced through health(),
        // and fed approval notifications alongside the worker
        // broadcast.
        let mut peer_pools = Vec::new();
        for peer in &config.peers {
            let endpoint = peer
                .endpoint()
                .map_err(|e| LifecycleError::BadPeer(peer.name.clone(), e))?;
            info!(peer = %peer.name, endpoint = %endpoint, "opening peer pool");
            let pool = ConnectionPool::new(endpoint, peer.pool.clone(), clock.clone());
            pool.warm().await;
            runtime.register_pool(peer.name.clone(), Arc::clone(&pool));
            peer_pools.push(pool);
        }

        // Approval outcomes go out to workers as broker events and to
        // every peer over its pool.
        let (peer_tx, mut peer_rx) = tokio::sync::mpsc::channel::<Envelope>(64);
        let forward_pools = peer_pools.clone();
        tokio::spawn(async move {
            while let Some(envelope) = peer_rx.recv().await {
                for pool in &forward_pools {
                    let delivered = pool.broadcast(&envelope).await;
                    debug!(endpoint = %pool.endpoint(), delivered, "peer notification");
                }
            }
        });
        let notify_broker = Arc::clone(&broker);
        let notify_clock = clock.clone();
        runtime.gate().set_notifier(Box::new(move |event, request| {
            let payload = serde_json::json!({
                "request": request.id.as_str(),
                "kind": request.kind,
                "state": request.state,
            });
            notify_broker.broadcast(event, payload.clone());
            let data = EventData { name: event.to_string(), payload };
            if let Ok(value) = serde_json::to_value(&data) {
                let envelope = Envelope::new(
                    format!("msg-{}", nanoid::nanoid!(12)),
                    MessageKind::Event,
                    BROKER_AGENT,
                    notify_clock.timestamp(),
                    value,
                );
                let _ = peer_tx.try_send(envelope);
            }
        }));

        // Expired pending approvals are swept once per minute.
        let sweep_runtime = Arc::clone(&runtime);
        let sweep_broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = sweep_broker.cancelled() => return,
                    _ = tick.tick() => sweep_runtime.gate().sweep_expired(),
                }
            }
        });

        Ok(Daemon { broker, runtime, peer_pools, socket_path })
    }

    pub fn runtime(&self) -> &Arc<Runtime<SystemClock, Broker<SystemClock>>> {
        &self.runtime
    }

    pub fn broker(&self) -> &Arc<Broker<SystemClock>> {
        &self.broker
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Block until SIGTERM or SIGINT, then drain and shut down.
    pub async fn run_until_shutdown(self) -> Result<(), LifecycleError> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received"),
            _ = int.recv() => info!("SIGINT received"),
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting work, wait for live runs up to the drain
    /// timeout, then tear the broker down and remove the socket.
    pub async fn shutdown(self) {
        info!("shutting down");
        let drain = env::drain_timeout();
        let deadline = tokio::time::Instant::now() + drain;
        while self.runtime.active_runs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.runtime.active_runs() > 0 {
            warn!(runs = self.runtime.active_runs(), "drain timeout, cancelling live runs");
        }
        self.runtime.shutdown();
        self.broker.shutdown();
        for pool in &self.peer_pools {
            pool.shutdown().await;
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "could not remove socket file");
            }
        }
    }
}

/// A leftover socket file from a dead daemon is unlinked; a live one
/// means another instance owns this state directory.
async fn reclaim_stale_socket(path: &std::path::Path) -> Result<(), LifecycleError> {
    if !path.exists() {
        return Ok(());
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Err(LifecycleError::AlreadyRunning(path.to_path_buf())),
        Err(_) => {
            warn!(socket = %path.display(), "removing stale socket");
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
