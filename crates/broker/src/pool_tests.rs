// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pool tests over an in-memory connector.

use super::*;
use crew_core::FakeClock;
use futures_util::FutureExt;
use parking_lot::Mutex as PlMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::DuplexStream;

/// Connector handing out duplex pipes. Server halves run an echo task
/// so send/recv round trips work; `fail_next` injects connect errors.
struct DuplexConnector {
    connects: AtomicU32,
    fail_next: AtomicU32,
    echo_tasks: PlMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DuplexConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            echo_tasks: PlMutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

async fn echo(server: DuplexStream) {
    let mut io = tokio::io::BufStream::new(server);
    while let Ok(envelope) = crew_wire::read_frame(&mut io).await {
        if crew_wire::write_frame(&mut io, &envelope).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> std::io::Result<Box<dyn PoolIo>> {
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "injected"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.echo_tasks.lock().push(tokio::spawn(echo(server)));
        Ok(Box::new(client))
    }
}

fn pool_with(
    config: PoolConfig,
) -> (Arc<ConnectionPool<FakeClock>>, Arc<DuplexConnector>, FakeClock) {
    let clock = FakeClock::new();
    let connector = DuplexConnector::new();
    let pool = ConnectionPool::with_connector(
        Endpoint::Unix(PathBuf::from("/tmp/test.sock")),
        config,
        clock.clone(),
        Arc::clone(&connector) as Arc<dyn Connector>,
    );
    (pool, connector, clock)
}

fn small_config() -> PoolConfig {
    PoolConfig {
        min: 0,
        max: 2,
        acquire_timeout_ms: 100,
        create_timeout_ms: 200,
        reconnect_base_ms: 5,
        reconnect_max_ms: 20,
        max_reconnect_attempts: 4,
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn acquire_release_leaves_counts_unchanged() {
    let (pool, _connector, _clock) = pool_with(small_config());

    let guard = pool.acquire().await.unwrap();
    assert_eq!(pool.stats(), PoolStats { size: 1, idle: 0, waiting: 0 });
    pool.release(guard);
    let settled = pool.stats();

    // Any further acquire/release pair restores the same counts.
    let guard = pool.acquire().await.unwrap();
    pool.release(guard);
    assert_eq!(pool.stats(), settled);
    assert_eq!(settled, PoolStats { size: 1, idle: 1, waiting: 0 });
}

#[tokio::test]
async fn acquire_reuses_idle_streams() {
    let (pool, connector, _clock) = pool_with(small_config());
    let first_id = {
        let guard = pool.acquire().await.unwrap();
        guard.id()
    };
    let guard = pool.acquire().await.unwrap();
    assert_eq!(guard.id(), first_id);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn acquire_at_max_times_out_with_pool_exhausted() {
    let (pool, _connector, _clock) = pool_with(PoolConfig { max: 1, ..small_config() });
    let held = pool.acquire().await.unwrap();

    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err, OrchestratorError::PoolExhausted { waited_ms: 100 });

    drop(held);
}

#[tokio::test]
async fn waiting_acquire_gets_the_released_stream() {
    let (pool, _connector, _clock) = pool_with(PoolConfig { max: 1, ..small_config() });
    let held = pool.acquire().await.unwrap();

    let pool2 = Arc::clone(&pool);
    let waiter = tokio::spawn(async move { pool2.acquire().await.map(|g| g.id()) });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let held_id = held.id();
    drop(held);

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, held_id);
}

#[tokio::test]
async fn closed_pool_refuses_acquire() {
    let (pool, _connector, _clock) = pool_with(small_config());
    pool.shutdown().await;
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err, OrchestratorError::PoolClosed);
}

#[tokio::test]
async fn shutdown_destroys_idle_streams() {
    let (pool, _connector, _clock) = pool_with(small_config());
    let guard = pool.acquire().await.unwrap();
    drop(guard);
    assert_eq!(pool.stats().idle, 1);

    pool.shutdown().await;
    assert_eq!(pool.stats(), PoolStats { size: 0, idle: 0, waiting: 0 });
}

#[tokio::test]
async fn broken_stream_is_destroyed_on_release() {
    let (pool, _connector, _clock) = pool_with(small_config());
    let mut guard = pool.acquire().await.unwrap();
    guard.mark_broken();
    drop(guard);
    assert_eq!(pool.stats(), PoolStats { size: 0, idle: 0, waiting: 0 });
}

#[tokio::test]
async fn broken_stream_is_replenished_toward_min() {
    let (pool, connector, _clock) =
        pool_with(PoolConfig { min: 1, ..small_config() });
    let mut guard = pool.acquire().await.unwrap();
    guard.mark_broken();
    drop(guard);

    // Background reconnect restores the minimum.
    for _ in 0..100 {
        if pool.stats().idle == 1 {
            assert_eq!(connector.connects(), 2);
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never replenished");
}

#[tokio::test]
async fn reconnect_retries_with_backoff_until_success() {
    let (pool, connector, _clock) =
        pool_with(PoolConfig { min: 1, ..small_config() });
    let mut guard = pool.acquire().await.unwrap();
    connector.fail_next(2);
    guard.mark_broken();
    drop(guard);

    for _ in 0..200 {
        if pool.stats().idle == 1 {
            // First connect plus the eventual successful reconnect.
            assert_eq!(connector.connects(), 2);
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("reconnect never succeeded");
}

#[tokio::test]
async fn idle_streams_past_timeout_are_not_reused() {
    let (pool, connector, clock) = pool_with(small_config());
    let guard = pool.acquire().await.unwrap();
    drop(guard);

    clock.advance(Duration::from_millis(PoolConfig::default().idle_timeout_ms + 1));
    let _guard = pool.acquire().await.unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn create_timeout_surfaces_as_transient() {
    struct NeverConnector;
    #[async_trait]
    impl Connector for NeverConnector {
        async fn connect(&self, _endpoint: &Endpoint) -> std::io::Result<Box<dyn PoolIo>> {
            futures_util::future::pending().await
        }
    }
    let pool = ConnectionPool::with_connector(
        Endpoint::Unix(PathBuf::from("/tmp/test.sock")),
        PoolConfig { create_timeout_ms: 30, ..small_config() },
        FakeClock::new(),
        Arc::new(NeverConnector),
    );
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Transient(_)));
    assert_eq!(pool.stats().size, 0);
}

#[tokio::test]
async fn send_recv_round_trip_through_pooled_stream() {
    let (pool, _connector, _clock) = pool_with(small_config());
    let mut guard = pool.acquire().await.unwrap();

    let envelope = Envelope::new(
        "msg-1",
        crew_wire::MessageKind::Ping,
        "broker",
        "2026-01-01T00:00:00+00:00",
        serde_json::json!({ "sent_ms": 1 }),
    );
    guard.send(&envelope).await.unwrap();
    let back = guard.recv().await.unwrap();
    assert_eq!(back, envelope);
}

#[tokio::test]
async fn with_releases_even_on_failure() {
    let (pool, _connector, _clock) = pool_with(small_config());

    let result: Result<(), _> = pool
        .with(|_stream| {
            async { Err(OrchestratorError::Transient("call failed".into())) }.boxed()
        })
        .await;
    assert!(result.is_err());
    // The stream went back to the idle set regardless.
    assert_eq!(pool.stats(), PoolStats { size: 1, idle: 1, waiting: 0 });
}

#[tokio::test]
async fn broadcast_writes_to_all_idle_streams() {
    let (pool, _connector, _clock) = pool_with(small_config());
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    drop(a);
    drop(b);
    assert_eq!(pool.stats().idle, 2);

    let envelope = Envelope::new(
        "msg-2",
        crew_wire::MessageKind::Event,
        "broker",
        "2026-01-01T00:00:00+00:00",
        serde_json::json!({ "name": "drain", "payload": {} }),
    );
    let delivered = pool.broadcast(&envelope).await;
    assert_eq!(delivered, 2);
    assert_eq!(pool.stats().idle, 2);
}

#[tokio::test]
async fn warm_prefills_min_streams() {
    let (pool, connector, _clock) = pool_with(PoolConfig { min: 2, ..small_config() });
    pool.warm().await;
    assert_eq!(pool.stats(), PoolStats { size: 2, idle: 2, waiting: 0 });
    assert_eq!(connector.connects(), 2);
}
