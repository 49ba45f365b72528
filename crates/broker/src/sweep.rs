// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background heartbeat sweep.
//!
//! Every tick: evict handles whose heartbeats stopped (failing their
//! task futures with `WorkerTimeout`), ping the survivors to feed the
//! EWMA latency, and restore degraded handles whose outbound queues
//! have drained.

use crew_core::{Clock, OrchestratorError};
use crew_wire::MessageKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::server::Broker;

impl<C: Clock> Broker<C> {
    /// Spawn the sweep task. Runs until broker shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(broker.config.sweep_interval_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = broker.cancel.cancelled() => {
                        debug!("sweep stopped");
                        return;
                    }
                    _ = tick.tick() => broker.sweep_once(),
                }
            }
        })
    }

    /// One sweep pass. Separated from the loop for tests driving a
    /// fake clock.
    pub fn sweep_once(&self) {
        let now_ms = self.clock.epoch_ms();

        for (kind, handle_id) in
            self.registry.expired(now_ms, self.config.heartbeat_timeout_ms)
        {
            warn!(worker = %kind, "heartbeat timeout, evicting");
            if let Some((tasks, cancel)) = self.registry.evict(kind, handle_id) {
                cancel.cancel();
                self.fail_tasks(kind, handle_id, &tasks, OrchestratorError::WorkerTimeout);
                self.broadcast(
                    "worker_evicted",
                    serde_json::json!({ "agent": kind.as_str(), "reason": "heartbeat_timeout" }),
                );
            }
        }

        // Degraded handles come back once their queues drain.
        for kind in self.registry.list() {
            self.registry.restore_if_drained(kind, self.config.outbound_queue_cap / 2);
        }

        self.ping_all();
    }

    /// Ping every registered worker; pongs update EWMA latency.
    fn ping_all(&self) {
        let sent_ms = self.clock.epoch_ms();
        for kind in self.registry.list() {
            let ping = self.new_envelope(
                MessageKind::Ping,
                serde_json::json!({ "sent_ms": sent_ms }),
            );
            let Ok(bytes) = crew_wire::encode(&ping) else { continue };
            if let Some((_, outbound)) = self.registry.outbound(kind) {
                let _ = outbound.try_send(bytes);
            }
        }
    }

}

#[cfg(test)]
#[path = "sweep_tests.rs"]
mod tests;
