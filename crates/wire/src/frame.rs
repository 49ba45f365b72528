// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Newline-delimited frame encoding/decoding.
//!
//! Framing is strict: one UTF-8 JSON object per line. A line over the
//! size cap or that fails to parse is a protocol violation and the
//! caller destroys the stream.

use crate::envelope::Envelope;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Maximum frame size (1 MiB). Reports travel as artifact paths, not
/// inline payloads, so frames stay small.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode an envelope to its wire bytes, newline terminator included.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let mut bytes = serde_json::to_vec(envelope)?;
    if bytes.len() >= MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: bytes.len(), max: MAX_FRAME_SIZE });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read one frame from a buffered async reader.
pub async fn read_frame<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Envelope, WireError> {
    let mut line = Vec::new();
    // take() caps the read so a frame without a newline cannot grow
    // the buffer unboundedly.
    let mut limited = reader.take(MAX_FRAME_SIZE as u64 + 1);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(WireError::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') {
        // Either the frame exceeded the cap or the peer closed mid-line.
        if n > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge { size: n, max: MAX_FRAME_SIZE });
        }
        return Err(WireError::ConnectionClosed);
    }
    line.pop();
    Ok(serde_json::from_slice(&line)?)
}

/// Write one frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), WireError> {
    let bytes = encode(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame with timeout
pub async fn read_frame_timeout<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Envelope, WireError> {
    tokio::time::timeout(timeout, read_frame(reader))
        .await
        .map_err(|_| WireError::Timeout)?
}

/// Write a frame with timeout
pub async fn write_frame_timeout<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<(), WireError> {
    tokio::time::timeout(timeout, write_frame(writer, envelope))
        .await
        .map_err(|_| WireError::Timeout)?
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
