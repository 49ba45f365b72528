// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! crew-broker: the IPC dataplane.
//!
//! A stream-socket server admits authenticated workers, installs them
//! in the agent registry, delivers tasks as newline-framed JSON, and
//! correlates responses back to per-task futures. A background sweep
//! evicts workers whose heartbeats stop. The client-side
//! [`ConnectionPool`] multiplexes outbound streams to a peer endpoint.

mod adapter;
mod auth;
mod delivery;
mod pool;
mod registry;
mod server;
mod sweep;

#[cfg(any(test, feature = "test-support"))]
mod fake;

#[cfg(test)]
mod test_fixtures;

pub use adapter::DispatchAdapter;
pub use pool::{
    ConnectionPool, Connector, Endpoint, PoolGuard, PoolIo, PoolStats, PooledStream,
    SocketConnector,
};
pub use registry::{AgentRegistry, HandleId};
pub use server::{Broker, BROKER_AGENT};

#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeDispatcher, ScriptedReply, ScriptedWorker};
