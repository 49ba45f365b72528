// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The runtime dependency container.
//!
//! Everything the workflow needs travels through one `Runtime` value:
//! the dispatch adapter, the breaker registry, the router, the approval
//! gate, and the clock. No process-wide singletons; tests build one
//! runtime per scenario with a fake clock and a fake dispatcher.

use crew_broker::{ConnectionPool, DispatchAdapter};
use crew_core::{
    ApprovalConfig, BreakerConfig, Clock, HealthSnapshot, RetryConfig, RouterConfig, RunId,
    WorkflowConfig,
};
use crew_resilience::{BreakerRegistry, RetryPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::approval::ApprovalGate;
use crate::router::Router;

pub struct Runtime<C: Clock, D: DispatchAdapter> {
    pub(crate) dispatcher: Arc<D>,
    pub(crate) breakers: Arc<BreakerRegistry<C>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) router: Router,
    pub(crate) gate: Arc<ApprovalGate<C>>,
    pub(crate) config: WorkflowConfig,
    pub(crate) clock: C,
    pub(crate) cancel: CancellationToken,
    pub(crate) runs: Mutex<HashMap<RunId, CancellationToken>>,
    pools: Mutex<Vec<(String, Arc<ConnectionPool<C>>)>>,
}

impl<C: Clock, D: DispatchAdapter> Runtime<C, D> {
    pub fn builder(dispatcher: Arc<D>, clock: C) -> RuntimeBuilder<C, D> {
        RuntimeBuilder {
            dispatcher,
            clock,
            workflow: WorkflowConfig::default(),
            router: RouterConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }

    /// Cancel a live run. Returns false when the run is unknown or
    /// already finished; cancelling twice is a no-op.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.runs.lock().get(&run_id) {
            Some(token) => {
                info!(run = %run_id, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live run and refuse new ones.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn gate(&self) -> &Arc<ApprovalGate<C>> {
        &self.gate
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry<C>> {
        &self.breakers
    }

    /// Track a pool so `health()` reports its occupancy.
    pub fn register_pool(&self, name: impl Into<String>, pool: Arc<ConnectionPool<C>>) {
        self.pools.lock().push((name.into(), pool));
    }

    /// Aggregate health: workers, breakers, pools.
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            workers: self.dispatcher.snapshot_health(),
            breakers: self.breakers.snapshot(),
            pools: self
                .pools
                .lock()
                .iter()
                .map(|(name, pool)| (name.clone(), pool.stats().into()))
                .collect(),
        }
    }

    /// Live run count, surfaced by the daemon's status logging.
    pub fn active_runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// Ids of the runs currently in flight.
    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().keys().copied().collect()
    }
}

pub struct RuntimeBuilder<C: Clock, D: DispatchAdapter> {
    dispatcher: Arc<D>,
    clock: C,
    workflow: WorkflowConfig,
    router: RouterConfig,
    breaker: BreakerConfig,
    retry: RetryConfig,
    approval: ApprovalConfig,
}

impl<C: Clock, D: DispatchAdapter> RuntimeBuilder<C, D> {
    pub fn workflow(mut self, config: WorkflowConfig) -> Self {
        self.workflow = config;
        self
    }

    pub fn router(mut self, config: RouterConfig) -> Self {
        self.router = config;
        self
    }

    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn approval(mut self, config: ApprovalConfig) -> Self {
        self.approval = config;
        self
    }

    pub fn build(self) -> Arc<Runtime<C, D>> {
        Arc::new(Runtime {
            dispatcher: self.dispatcher,
            breakers: Arc::new(BreakerRegistry::new(self.breaker, self.clock.clone())),
            retry: RetryPolicy::new(self.retry),
            router: Router::new(self.router),
            gate: Arc::new(ApprovalGate::new(self.approval, self.clock.clone())),
            config: self.workflow,
            clock: self.clock,
            cancel: CancellationToken::new(),
            runs: Mutex::new(HashMap::new()),
            pools: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
