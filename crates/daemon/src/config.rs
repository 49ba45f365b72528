// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: optional `crewd.toml` over built-in defaults.

use crew_broker::Endpoint;
use crew_core::{
    ApprovalConfig, BreakerConfig, BrokerConfig, PoolConfig, RetryConfig, RouterConfig,
    WorkflowConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::lifecycle::LifecycleError;

/// Everything `crewd` reads from disk. Every section and field is
/// optional; a missing file yields pure defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub broker: BrokerConfig,
    pub workflow: WorkflowConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub router: RouterConfig,
    pub approval: ApprovalConfig,
    /// Cross-process peers the daemon keeps warm outbound stream pools
    /// to (report mirrors, a sibling broker). Empty by default.
    pub peers: Vec<PeerConfig>,
}

/// One outbound peer endpoint and its pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    /// Local stream socket of the peer. Mutually exclusive with
    /// `host`/`port`.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl PeerConfig {
    /// Resolve the configured address. Exactly one of `socket` or
    /// `host` + `port` must be set.
    pub fn endpoint(&self) -> Result<Endpoint, String> {
        match (&self.socket, &self.host, self.port) {
            (Some(path), None, None) => Ok(Endpoint::Unix(path.clone())),
            (None, Some(host), Some(port)) => Ok(Endpoint::Tcp(host.clone(), port)),
            (None, Some(_), None) => Err("host set without port".to_string()),
            _ => Err("set either socket or host + port".to_string()),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, treating a missing file as defaults.
    pub fn load(path: &Path) -> Result<Self, LifecycleError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| LifecycleError::BadConfig(path.to_path_buf(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LifecycleError::Io(e)),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
