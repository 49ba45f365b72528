// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Framing tests: newline termination, size cap, closed streams.

use super::*;
use crate::envelope::{Envelope, MessageKind};
use tokio::io::BufReader;

fn heartbeat(agent: &str) -> Envelope {
    Envelope::new(
        "msg-1",
        MessageKind::Heartbeat,
        agent,
        "2026-01-01T00:00:00+00:00",
        serde_json::Value::Null,
    )
}

#[test]
fn encode_terminates_with_newline() {
    let bytes = encode(&heartbeat("quality")).unwrap();
    assert_eq!(bytes.last(), Some(&b'\n'));
    // No interior newlines: one frame per line.
    assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
}

#[tokio::test]
async fn write_read_roundtrip() {
    let env = heartbeat("security");
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &env).await.unwrap();

    let mut reader = BufReader::new(std::io::Cursor::new(buffer));
    let back = read_frame(&mut reader).await.unwrap();
    assert_eq!(back, env);
}

#[tokio::test]
async fn two_frames_on_one_stream_read_in_order() {
    let a = heartbeat("security");
    let b = heartbeat("quality");
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &a).await.unwrap();
    write_frame(&mut buffer, &b).await.unwrap();

    let mut reader = BufReader::new(std::io::Cursor::new(buffer));
    assert_eq!(read_frame(&mut reader).await.unwrap().agent, "security");
    assert_eq!(read_frame(&mut reader).await.unwrap().agent, "quality");
}

#[tokio::test]
async fn empty_stream_reads_connection_closed() {
    let mut reader = BufReader::new(std::io::Cursor::new(Vec::new()));
    let err = read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, WireError::ConnectionClosed));
}

#[tokio::test]
async fn truncated_frame_reads_connection_closed() {
    // A frame without its newline terminator: the peer died mid-write.
    let mut reader = BufReader::new(std::io::Cursor::new(b"{\"id\":\"x\"".to_vec()));
    let err = read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, WireError::ConnectionClosed));
}

#[tokio::test]
async fn garbage_line_is_a_json_error() {
    let mut reader = BufReader::new(std::io::Cursor::new(b"not json\n".to_vec()));
    let err = read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, WireError::Json(_)));
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let mut line = vec![b'x'; MAX_FRAME_SIZE + 16];
    line.push(b'\n');
    let mut reader = BufReader::new(std::io::Cursor::new(line));
    let err = read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, WireError::FrameTooLarge { .. }));
}

#[test]
fn encode_rejects_oversized_envelope() {
    let mut env = heartbeat("quality");
    env.data = serde_json::Value::String("y".repeat(MAX_FRAME_SIZE));
    let err = encode(&env).unwrap_err();
    assert!(matches!(err, WireError::FrameTooLarge { .. }));
}

#[tokio::test]
async fn write_frame_timeout_passes_through_on_time() {
    let env = heartbeat("quality");
    let mut buffer = Vec::new();
    write_frame_timeout(&mut buffer, &env, std::time::Duration::from_secs(1))
        .await
        .unwrap();
    let mut reader = BufReader::new(std::io::Cursor::new(buffer));
    assert_eq!(read_frame(&mut reader).await.unwrap(), env);
}

#[tokio::test]
async fn read_frame_timeout_surfaces_timeout() {
    // A duplex pipe with no data: the read must give up.
    let (client, _server) = tokio::io::duplex(64);
    let mut reader = BufReader::new(client);
    let err = read_frame_timeout(&mut reader, std::time::Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, WireError::Timeout));
}
