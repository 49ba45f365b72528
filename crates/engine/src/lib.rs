// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! crew-engine: routing, approval, and the workflow state machine.
//!
//! A [`Runtime`] carries every dependency explicitly (dispatcher,
//! breaker registry, router, approval gate, clock); `submit` drives one
//! change event through ROUTE → DISPATCH → COLLECT → SYNTHESIZE →
//! GATE → FINALIZE and returns the run's [`crew_core::WorkflowResult`].

pub mod approval;
pub mod router;
mod runtime;
mod workflow;

pub use approval::{ApprovalGate, ApprovalId, ApprovalRequest, ApprovalState, ApprovalVote};
pub use router::{RoutePlan, Router, Strategy};
pub use runtime::{Runtime, RuntimeBuilder};
