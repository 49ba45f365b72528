// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use crate::lifecycle::LifecycleError;
use std::path::PathBuf;
use std::time::Duration;

/// Resolve state directory: CREW_STATE_DIR > XDG_STATE_HOME/crew >
/// ~/.local/state/crew
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("CREW_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("crew"));
    }
    let home = std::env::var("HOME").map_err(|_| LifecycleError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".local/state/crew"))
}

/// Socket path override; defaults to `<state_dir>/crewd.sock`.
pub fn socket_path() -> Option<PathBuf> {
    std::env::var("CREW_SOCKET").ok().filter(|s| !s.is_empty()).map(PathBuf::from)
}

/// The worker auth secret. When unset a random one is generated at
/// startup and logged, which only works for workers spawned with the
/// daemon's environment.
pub fn auth_token() -> Option<String> {
    std::env::var("CREW_AUTH_TOKEN").ok().filter(|s| !s.is_empty())
}

/// Config file override; defaults to `<state_dir>/crewd.toml`.
pub fn config_path() -> Option<PathBuf> {
    std::env::var("CREW_CONFIG").ok().filter(|s| !s.is_empty()).map(PathBuf::from)
}

/// Shutdown drain timeout (default 5s, configurable via
/// `CREW_DRAIN_TIMEOUT_MS`).
pub fn drain_timeout() -> Duration {
    std::env::var("CREW_DRAIN_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(5))
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
