// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for broker/worker communication.
//!
//! Wire format: newline-terminated UTF-8 JSON envelopes.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod envelope;
mod frame;

pub use envelope::{
    AuthData, Envelope, EventData, MessageKind, RegistrationData, TaskData, TaskResponseData,
};
pub use frame::{
    encode, read_frame, read_frame_timeout, write_frame, write_frame_timeout, WireError,
    MAX_FRAME_SIZE,
};

#[cfg(test)]
mod property_tests;
