// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for broker tests: an in-memory worker client
//! speaking the wire protocol over a duplex pipe.

use crate::server::Broker;
use crew_core::{BrokerConfig, FakeClock, WorkerKind};
use crew_wire::{AuthData, Envelope, MessageKind, RegistrationData};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

pub(crate) const TEST_SECRET: &str = "test-secret";

pub(crate) fn test_broker() -> (Arc<Broker<FakeClock>>, FakeClock) {
    test_broker_with(BrokerConfig::default())
}

pub(crate) fn test_broker_with(config: BrokerConfig) -> (Arc<Broker<FakeClock>>, FakeClock) {
    let clock = FakeClock::new();
    let broker = Broker::new(config, TEST_SECRET, clock.clone());
    (broker, clock)
}

/// One in-memory worker connection.
pub(crate) struct TestWorker {
    pub agent: String,
    pub reader: BufReader<ReadHalf<DuplexStream>>,
    pub writer: WriteHalf<DuplexStream>,
    pub conn: tokio::task::JoinHandle<()>,
}

impl TestWorker {
    pub async fn send(&mut self, kind: MessageKind, id: &str, data: serde_json::Value) {
        let envelope =
            Envelope::new(id, kind, self.agent.clone(), "2026-01-01T00:00:00+00:00", data);
        crew_wire::write_frame(&mut self.writer, &envelope)
            .await
            .expect("test worker write");
    }

    pub async fn next(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), crew_wire::read_frame(&mut self.reader))
            .await
            .expect("test worker read timed out")
            .expect("test worker read")
    }

    /// Read frames until one of `kind` arrives (skipping broadcasts,
    /// pings, and other chatter).
    pub async fn next_of(&mut self, kind: MessageKind) -> Envelope {
        loop {
            let envelope = self.next().await;
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    /// Reply `done` to a received task frame, echoing its id.
    pub async fn respond_done(&mut self, task: &Envelope, findings: u64) {
        let id = task.id.clone();
        self.send(
            MessageKind::Task,
            &id,
            serde_json::json!({
                "status": "done",
                "results": { "findings": findings },
                "kpis": { "latency_ms": 10, "tokens": 500, "findings": findings },
                "artifacts": ["/tmp/report.json"],
            }),
        )
        .await;
    }
}

/// Open a raw (un-handshaken) connection to the broker.
pub(crate) fn connect_raw(
    broker: &Arc<Broker<FakeClock>>,
    buffer: usize,
) -> (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(buffer);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let conn = tokio::spawn(Arc::clone(broker).handle_connection(server_read, server_write));
    (BufReader::new(client_read), client_write, conn)
}

/// Connect and complete the auth + registration handshake.
pub(crate) async fn connect(broker: &Arc<Broker<FakeClock>>, kind: WorkerKind) -> TestWorker {
    connect_buffered(broker, kind, 64 * 1024).await
}

pub(crate) async fn connect_buffered(
    broker: &Arc<Broker<FakeClock>>,
    kind: WorkerKind,
    buffer: usize,
) -> TestWorker {
    let (reader, writer, conn) = connect_raw(broker, buffer);
    let mut worker = TestWorker { agent: kind.as_str().to_string(), reader, writer, conn };
    worker
        .send(
            MessageKind::Auth,
            "msg-auth",
            serde_json::to_value(AuthData {
                token: TEST_SECRET.to_string(),
                agent_id: kind.as_str().to_string(),
            })
            .expect("auth payload"),
        )
        .await;
    worker
        .send(
            MessageKind::Registration,
            "msg-reg",
            serde_json::to_value(RegistrationData { pid: 4242, capabilities: vec![] })
                .expect("registration payload"),
        )
        .await;
    wait_for_registration(broker, kind).await;
    worker
}

/// The handshake has no ack frame; poll the registry instead.
pub(crate) async fn wait_for_registration(broker: &Arc<Broker<FakeClock>>, kind: WorkerKind) {
    for _ in 0..200 {
        if broker.registry().contains(kind) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("worker {kind} never registered");
}

/// Poll until the registry drops the identity.
pub(crate) async fn wait_for_eviction(broker: &Arc<Broker<FakeClock>>, kind: WorkerKind) {
    for _ in 0..200 {
        if !broker.registry().contains(kind) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("worker {kind} never evicted");
}
