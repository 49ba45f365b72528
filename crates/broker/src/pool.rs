// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side connection pool.
//!
//! Keeps between `min` and `max` persistent streams to one endpoint.
//! `acquire` hands out a validated idle stream or creates one; a
//! bounded semaphore makes waiting fair and `acquire_timeout` turns
//! starvation into `PoolExhausted`. Broken streams are destroyed on
//! release and replaced in the background with capped exponential
//! backoff, so the acquire path never blocks on reconnection.

use async_trait::async_trait;
use crew_core::{Clock, OrchestratorError, PoolConfig, PoolHealth};
use crew_wire::{Envelope, WireError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A hard error on a stream disqualifies it from reuse for this long.
const HARD_ERROR_COOLDOWN_MS: u64 = 60_000;

/// Where the pool connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(host, port) => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Object-safe stream bound used by pooled connections.
pub trait PoolIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PoolIo for T {}

/// Opens streams to an endpoint. Swappable for tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn PoolIo>>;
}

/// Real socket connector.
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> std::io::Result<Box<dyn PoolIo>> {
        match endpoint {
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            Endpoint::Tcp(host, port) => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// One pooled stream with its reuse metadata.
pub struct PooledStream {
    id: u64,
    io: BufStream<Box<dyn PoolIo>>,
    last_used_ms: u64,
    last_error_ms: Option<u64>,
    broken: bool,
}

impl PooledStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one frame; a failure marks the stream broken.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), WireError> {
        match crew_wire::write_frame(&mut self.io, envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Read one frame; a failure marks the stream broken.
    pub async fn recv(&mut self) -> Result<Envelope, WireError> {
        match crew_wire::read_frame(&mut self.io).await {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Disqualify this stream from returning to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

struct PoolInner {
    idle: VecDeque<PooledStream>,
    /// Idle plus checked-out streams.
    size: usize,
    waiting: usize,
    closed: bool,
    next_id: u64,
}

/// Bounded pool of persistent client streams to one endpoint.
pub struct ConnectionPool<C: Clock> {
    endpoint: Endpoint,
    config: PoolConfig,
    clock: C,
    connector: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
    inner: Mutex<PoolInner>,
}

/// Checked-out stream. Dropping it releases back to the pool;
/// [`ConnectionPool::release`] is the explicit spelling of the same.
pub struct PoolGuard<C: Clock> {
    stream: Option<PooledStream>,
    pool: Arc<ConnectionPool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Clock> std::fmt::Debug for PoolGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<C: Clock> Deref for PoolGuard<C> {
    type Target = PooledStream;

    fn deref(&self) -> &PooledStream {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("guard stream taken before drop"),
        }
    }
}

impl<C: Clock> DerefMut for PoolGuard<C> {
    fn deref_mut(&mut self) -> &mut PooledStream {
        match &mut self.stream {
            Some(stream) => stream,
            None => unreachable!("guard stream taken before drop"),
        }
    }
}

impl<C: Clock> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.give_back(stream);
        }
    }
}

impl<C: Clock> ConnectionPool<C> {
    pub fn new(endpoint: Endpoint, config: PoolConfig, clock: C) -> Arc<Self> {
        Self::with_connector(endpoint, config, clock, Arc::new(SocketConnector))
    }

    pub fn with_connector(
        endpoint: Endpoint,
        config: PoolConfig,
        clock: C,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let max = config.max.max(1);
        Arc::new(Self {
            endpoint,
            config,
            clock,
            connector,
            semaphore: Arc::new(Semaphore::new(max)),
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                size: 0,
                waiting: 0,
                closed: false,
                next_id: 0,
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Pre-open `min` streams. Best effort: failures are logged and
    /// left to background replenishment.
    pub async fn warm(self: &Arc<Self>) {
        for _ in 0..self.config.min {
            match self.create_stream().await {
                Ok(stream) => {
                    let mut inner = self.inner.lock();
                    inner.size += 1;
                    inner.idle.push_back(stream);
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "warm-up connect failed");
                    self.spawn_replenish();
                    break;
                }
            }
        }
    }

    /// Check out a healthy stream, waiting up to `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard<C>, OrchestratorError> {
        if self.inner.lock().closed {
            return Err(OrchestratorError::PoolClosed);
        }

        self.inner.lock().waiting += 1;
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.acquire_timeout_ms),
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await;
        self.inner.lock().waiting -= 1;

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(OrchestratorError::PoolClosed),
            Err(_) => {
                return Err(OrchestratorError::PoolExhausted {
                    waited_ms: self.config.acquire_timeout_ms,
                })
            }
        };

        // Reuse a validated idle stream if any survived.
        let now_ms = self.clock.epoch_ms();
        loop {
            let candidate = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(OrchestratorError::PoolClosed);
                }
                inner.idle.pop_front()
            };
            match candidate {
                Some(stream) if self.is_reusable(&stream, now_ms) => {
                    return Ok(PoolGuard {
                        stream: Some(stream),
                        pool: Arc::clone(self),
                        _permit: permit,
                    });
                }
                Some(stream) => {
                    debug!(endpoint = %self.endpoint, stream = stream.id, "destroying stale stream");
                    self.destroy(stream);
                }
                None => break,
            }
        }

        // Nothing idle: create, counting the slot up front so parallel
        // acquires cannot overshoot `max`.
        {
            let mut inner = self.inner.lock();
            if inner.size >= self.config.max {
                // All slots are checked out or mid-destruction; the
                // permit said otherwise, so surface exhaustion.
                return Err(OrchestratorError::PoolExhausted {
                    waited_ms: self.config.acquire_timeout_ms,
                });
            }
            inner.size += 1;
        }
        match self.create_stream().await {
            Ok(stream) => {
                Ok(PoolGuard { stream: Some(stream), pool: Arc::clone(self), _permit: permit })
            }
            Err(e) => {
                self.inner.lock().size -= 1;
                Err(e)
            }
        }
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(&self, guard: PoolGuard<C>) {
        drop(guard);
    }

    /// Acquire, run `f`, release even on failure.
    pub async fn with<T, F>(self: &Arc<Self>, f: F) -> Result<T, OrchestratorError>
    where
        F: for<'a> FnOnce(
            &'a mut PooledStream,
        )
            -> futures_util::future::BoxFuture<'a, Result<T, OrchestratorError>>,
    {
        let mut guard = self.acquire().await?;
        f(&mut guard).await
        // Guard drop releases (or destroys a broken stream).
    }

    /// Write an event frame on every idle stream. Streams that fail are
    /// destroyed; the call reports how many writes succeeded.
    pub async fn broadcast(self: &Arc<Self>, envelope: &Envelope) -> usize {
        let streams: Vec<PooledStream> = {
            let mut inner = self.inner.lock();
            inner.idle.drain(..).collect()
        };
        let mut delivered = 0;
        for mut stream in streams {
            match stream.send(envelope).await {
                Ok(()) => {
                    delivered += 1;
                    self.give_back(stream);
                }
                Err(e) => {
                    debug!(endpoint = %self.endpoint, stream = stream.id, error = %e, "broadcast write failed");
                    self.give_back(stream); // broken: destroyed + replenished
                }
            }
        }
        delivered
    }

    /// Stop handing out streams and destroy the idle set.
    pub async fn shutdown(self: &Arc<Self>) {
        let streams: Vec<PooledStream> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.size = inner.size.saturating_sub(inner.idle.len());
            inner.idle.drain(..).collect()
        };
        self.semaphore.close();
        for stream in streams {
            let deadline = Duration::from_millis(self.config.destroy_timeout_ms);
            let mut io = stream.io;
            let _ = tokio::time::timeout(deadline, io.shutdown()).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats { size: inner.size, idle: inner.idle.len(), waiting: inner.waiting }
    }

    fn is_reusable(&self, stream: &PooledStream, now_ms: u64) -> bool {
        if stream.broken {
            return false;
        }
        if let Some(error_ms) = stream.last_error_ms {
            if now_ms.saturating_sub(error_ms) < HARD_ERROR_COOLDOWN_MS {
                return false;
            }
        }
        now_ms.saturating_sub(stream.last_used_ms) <= self.config.idle_timeout_ms
    }

    async fn create_stream(self: &Arc<Self>) -> Result<PooledStream, OrchestratorError> {
        let deadline = Duration::from_millis(self.config.create_timeout_ms);
        let io = tokio::time::timeout(deadline, self.connector.connect(&self.endpoint))
            .await
            .map_err(|_| {
                OrchestratorError::Transient(format!("connect to {} timed out", self.endpoint))
            })?
            .map_err(|e| {
                OrchestratorError::Transient(format!("connect to {} failed: {e}", self.endpoint))
            })?;
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            inner.next_id
        };
        debug!(endpoint = %self.endpoint, stream = id, "stream connected");
        Ok(PooledStream {
            id,
            io: BufStream::new(io),
            last_used_ms: self.clock.epoch_ms(),
            last_error_ms: None,
            broken: false,
        })
    }

    /// Return a checked-out stream: healthy goes back to the idle set,
    /// broken is destroyed and replaced in the background.
    fn give_back(self: &Arc<Self>, mut stream: PooledStream) {
        let now_ms = self.clock.epoch_ms();
        stream.last_used_ms = now_ms;
        let mut inner = self.inner.lock();
        if inner.closed {
            inner.size = inner.size.saturating_sub(1);
            return;
        }
        if stream.broken {
            stream.last_error_ms = Some(now_ms);
            inner.size = inner.size.saturating_sub(1);
            drop(inner);
            debug!(endpoint = %self.endpoint, stream = stream.id, "destroying broken stream");
            self.spawn_replenish();
            return;
        }
        inner.idle.push_back(stream);
    }

    fn destroy(self: &Arc<Self>, _stream: PooledStream) {
        let mut inner = self.inner.lock();
        inner.size = inner.size.saturating_sub(1);
        drop(inner);
        self.spawn_replenish();
    }

    /// Restore the pool toward `min` with capped exponential backoff.
    /// Runs detached; the acquire path never waits on it.
    fn spawn_replenish(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(pool.config.reconnect_base_ms);
            for attempt in 1..=pool.config.max_reconnect_attempts {
                {
                    let inner = pool.inner.lock();
                    if inner.closed || inner.size >= pool.config.min {
                        return;
                    }
                }
                match pool.create_stream().await {
                    Ok(stream) => {
                        let mut inner = pool.inner.lock();
                        if inner.closed || inner.size >= pool.config.max {
                            return;
                        }
                        inner.size += 1;
                        inner.idle.push_back(stream);
                        return;
                    }
                    Err(e) => {
                        debug!(endpoint = %pool.endpoint, attempt, error = %e, "reconnect failed");
                        tokio::time::sleep(delay).await;
                        let next = delay.as_millis() as f64 * pool.config.reconnect_multiplier;
                        delay = Duration::from_millis(
                            (next as u64).min(pool.config.reconnect_max_ms),
                        );
                    }
                }
            }
            warn!(endpoint = %pool.endpoint, "reconnect attempts exhausted");
        });
    }
}

/// Occupancy counters for `health()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub waiting: usize,
}

impl From<PoolStats> for PoolHealth {
    fn from(stats: PoolStats) -> Self {
        PoolHealth { size: stats.size, idle: stats.idle, waiting: stats.waiting }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
