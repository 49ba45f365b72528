// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

#[tokio::test]
async fn stale_socket_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crewd.sock");
    // A bound-then-dropped listener leaves the file behind.
    drop(tokio::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    reclaim_stale_socket(&path).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn live_socket_means_already_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crewd.sock");
    let _listener = tokio::net::UnixListener::bind(&path).unwrap();

    let err = reclaim_stale_socket(&path).await.unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyRunning(_)));
    assert!(path.exists());
}

#[tokio::test]
async fn missing_socket_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    reclaim_stale_socket(&dir.path().join("crewd.sock")).await.unwrap();
}

#[tokio::test]
#[serial]
async fn daemon_start_binds_and_shutdown_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CREW_STATE_DIR", dir.path());
    std::env::set_var("CREW_AUTH_TOKEN", "lifecycle-test");

    let mut config = DaemonConfig::default();
    config.workflow.reports_dir = dir.path().join("reports");
    let daemon = Daemon::start(config).await.unwrap();
    let socket = daemon.socket_path().clone();
    assert!(socket.exists());
    assert_eq!(daemon.runtime().active_runs(), 0);

    // A second instance on the same state dir is refused.
    let mut config2 = DaemonConfig::default();
    config2.workflow.reports_dir = dir.path().join("reports");
    let second = Daemon::start(config2).await;
    assert!(matches!(second, Err(LifecycleError::AlreadyRunning(_))));

    daemon.shutdown().await;
    assert!(!socket.exists());

    std::env::remove_var("CREW_STATE_DIR");
    std::env::remove_var("CREW_AUTH_TOKEN");
}

#[tokio::test]
#[serial]
async fn peer_pools_are_warmed_and_reported_in_health() {
    use crate::config::PeerConfig;
    use crew_core::PoolConfig;

    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CREW_STATE_DIR", dir.path());
    std::env::set_var("CREW_AUTH_TOKEN", "lifecycle-test");

    // A stand-in peer daemon: accepts and holds connections.
    let peer_socket = dir.path().join("mirror.sock");
    let peer_listener = tokio::net::UnixListener::bind(&peer_socket).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = peer_listener.accept().await {
            held.push(stream);
        }
    });

    let mut config = DaemonConfig::default();
    config.workflow.reports_dir = dir.path().join("reports");
    config.peers.push(PeerConfig {
        name: "mirror".to_string(),
        socket: Some(peer_socket),
        host: None,
        port: None,
        pool: PoolConfig { min: 1, max: 2, ..PoolConfig::default() },
    });

    let daemon = Daemon::start(config).await.unwrap();
    let health = daemon.runtime().health();
    let mirror = &health.pools["mirror"];
    assert_eq!(mirror.size, 1);
    assert_eq!(mirror.idle, 1);

    daemon.shutdown().await;
    std::env::remove_var("CREW_STATE_DIR");
    std::env::remove_var("CREW_AUTH_TOKEN");
}

#[tokio::test]
#[serial]
async fn misconfigured_peer_fails_startup() {
    use crate::config::PeerConfig;
    use crew_core::PoolConfig;

    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CREW_STATE_DIR", dir.path());
    std::env::set_var("CREW_AUTH_TOKEN", "lifecycle-test");

    let mut config = DaemonConfig::default();
    config.workflow.reports_dir = dir.path().join("reports");
    config.peers.push(PeerConfig {
        name: "nowhere".to_string(),
        socket: None,
        host: None,
        port: None,
        pool: PoolConfig::default(),
    });

    let err = Daemon::start(config).await.unwrap_err();
    assert!(matches!(err, LifecycleError::BadPeer(_, _)));

    std::env::remove_var("CREW_STATE_DIR");
    std::env::remove_var("CREW_AUTH_TOKEN");
}

#[tokio::test]
#[serial]
async fn workers_can_register_with_a_started_daemon() {
    use crew_broker::{ScriptedReply, ScriptedWorker};
    use crew_core::WorkerKind;

    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CREW_STATE_DIR", dir.path());
    std::env::set_var("CREW_AUTH_TOKEN", "lifecycle-test");

    let mut config = DaemonConfig::default();
    config.workflow.reports_dir = dir.path().join("reports");
    let daemon = Daemon::start(config).await.unwrap();

    let worker = ScriptedWorker::spawn(
        daemon.socket_path(),
        WorkerKind::Quality,
        "lifecycle-test",
        ScriptedReply::done(0),
    )
    .await
    .unwrap();

    for _ in 0..200 {
        if daemon.broker().registry().contains(WorkerKind::Quality) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(daemon.broker().registry().contains(WorkerKind::Quality));

    worker.kill();
    daemon.shutdown().await;
    std::env::remove_var("CREW_STATE_DIR");
    std::env::remove_var("CREW_AUTH_TOKEN");
}
