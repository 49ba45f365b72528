// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `crewd`: the Crew orchestration daemon.

use crew_daemon::{config, env, lifecycle, DaemonConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("crewd: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), lifecycle::LifecycleError> {
    let state_dir = env::state_dir()?;
    std::fs::create_dir_all(&state_dir)?;

    // Logs go to a rolling file; RUST_LOG controls verbosity.
    let log_dir = state_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(&log_dir, "crewd.log");
    let (writer, _guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let config_path = env::config_path().unwrap_or_else(|| state_dir.join("crewd.toml"));
    let config = config::DaemonConfig::load(&config_path)?;
    log_effective_config(&config);

    let daemon = lifecycle::Daemon::start(config).await?;
    info!(socket = %daemon.socket_path().display(), "crewd up");
    daemon.run_until_shutdown().await
}

fn log_effective_config(config: &DaemonConfig) {
    info!(
        max_connections = config.broker.max_connections,
        heartbeat_timeout_ms = config.broker.heartbeat_timeout_ms,
        failure_threshold = config.breaker.failure_threshold,
        critical_operations = config.approval.critical_operations.len(),
        "configuration loaded"
    );
}
