// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Routing: change event + registry health → worker set and strategy.
//!
//! Selection is a fixed ordered rule table; every matching rule
//! contributes its workers, then the registry health filter drops
//! anything that cannot take a task right now. An empty filtered set
//! falls back to the single healthiest worker rather than failing the
//! run. Decisions are memoized briefly since bursts of pushes to one
//! branch tend to look alike.

use crew_core::{ChangeEvent, RouterConfig, WorkerHealth, WorkerKind};
use parking_lot::Mutex;
use std::collections::HashMap;

/// File names that indicate a dependency manifest or container
/// descriptor was touched.
const MANIFEST_NAMES: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "go.mod",
    "go.sum",
    "requirements.txt",
    "Pipfile.lock",
    "poetry.lock",
    "Gemfile.lock",
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Path fragments that indicate a schema or API descriptor.
const API_DESCRIPTOR_HINTS: &[&str] =
    &["openapi", "swagger", ".proto", ".graphql", "schema.json", "api.yaml", "api.yml"];

/// Aggregate thresholds for the architecture rule.
const LARGE_CHANGE_LINES: u64 = 500;
const LARGE_CHANGE_FILES: usize = 10;

/// A worker at or above this many queued tasks is skipped by routing.
const QUEUE_DEPTH_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Parallel,
    Sequential,
    Hybrid,
}

/// The routing decision for one change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    /// Selected workers in rule order, synthesizer last.
    pub workers: Vec<WorkerKind>,
    pub strategy: Strategy,
    /// Dispatch groups, outer sequential, inner parallel. Only set for
    /// [`Strategy::Hybrid`] plans.
    pub groups: Option<Vec<Vec<WorkerKind>>>,
    pub reasoning: String,
    pub confidence: f64,
    /// The filtered set was empty and a fallback worker was chosen.
    pub used_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo: String,
    branch: String,
    file_bucket: u8,
    identities: Vec<WorkerKind>,
    load_bucket: u8,
}

pub struct Router {
    config: RouterConfig,
    cache: Mutex<HashMap<CacheKey, (RoutePlan, u64)>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config, cache: Mutex::new(HashMap::new()) }
    }

    /// Decide the worker set for `event` given current registry health.
    pub fn route(
        &self,
        event: &ChangeEvent,
        health: &HashMap<WorkerKind, WorkerHealth>,
        now_ms: u64,
    ) -> RoutePlan {
        let key = cache_key(event, health);
        {
            let mut cache = self.cache.lock();
            // Stale entries are purged on read.
            cache.retain(|_, (_, at)| now_ms.saturating_sub(*at) <= self.config.cache_max_age_ms);
            if let Some((plan, _)) = cache.get(&key) {
                return plan.clone();
            }
        }

        let plan = self.decide(event, health);
        self.cache.lock().insert(key, (plan.clone(), now_ms));
        plan
    }

    fn decide(&self, event: &ChangeEvent, health: &HashMap<WorkerKind, WorkerHealth>) -> RoutePlan {
        let mut selected: Vec<WorkerKind> = Vec::new();
        let mut reasons: Vec<String> = Vec::new();
        let mut rules_fired = 0u32;

        if event.paths().any(|p| is_manifest(&p)) {
            selected.push(WorkerKind::Security);
            reasons.push("dependency manifest touched".to_string());
            rules_fired += 1;
        }
        if event.total_lines_changed() > LARGE_CHANGE_LINES
            || event.file_count() >= LARGE_CHANGE_FILES
        {
            selected.push(WorkerKind::Architecture);
            reasons.push(format!(
                "large change ({} lines, {} files)",
                event.total_lines_changed(),
                event.file_count()
            ));
            rules_fired += 1;
        }
        if event.paths().any(|p| is_api_descriptor(&p)) {
            selected.push(WorkerKind::Documentation);
            reasons.push("api descriptor touched".to_string());
            rules_fired += 1;
        }
        // Unconditional contributors.
        selected.push(WorkerKind::Quality);
        selected.push(WorkerKind::Synthesizer);
        rules_fired += 1;

        // Health filter: drop anything that cannot take a task.
        let mut workers: Vec<WorkerKind> = selected
            .iter()
            .copied()
            .filter(|kind| is_routable(health.get(kind)))
            .collect();

        let mut used_fallback = false;
        if workers.is_empty() {
            // Emergency fallback: the least-loaded healthy worker.
            let mut healthy: Vec<(WorkerKind, usize)> = health
                .iter()
                .filter(|(_, h)| h.status.accepts_tasks())
                .map(|(kind, h)| (*kind, h.queue_depth))
                .collect();
            healthy.sort_by_key(|(kind, depth)| (*depth, *kind));
            if let Some((kind, _)) = healthy.first() {
                workers.push(*kind);
                used_fallback = true;
                reasons.push(format!("emergency fallback to {kind}"));
            }
        }

        // Non-synthesizer count decides the strategy.
        let dispatchable = workers.iter().filter(|k| **k != WorkerKind::Synthesizer).count();
        let strategy =
            if dispatchable > 2 { Strategy::Parallel } else { Strategy::Sequential };

        RoutePlan {
            workers,
            strategy,
            groups: None,
            reasoning: reasons.join("; "),
            confidence: confidence(rules_fired, used_fallback),
            used_fallback,
        }
    }
}

/// Fixed heuristic: half a point baseline plus a tenth per fired rule,
/// capped, and halved when the emergency fallback was taken.
fn confidence(rules_fired: u32, used_fallback: bool) -> f64 {
    let base = (0.5 + 0.1 * f64::from(rules_fired)).min(0.9);
    if used_fallback {
        base / 2.0
    } else {
        base
    }
}

fn is_routable(health: Option<&WorkerHealth>) -> bool {
    match health {
        Some(h) => h.status.accepts_tasks() && h.queue_depth < QUEUE_DEPTH_CAP,
        None => false,
    }
}

fn is_manifest(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    MANIFEST_NAMES.contains(&name)
}

fn is_api_descriptor(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    API_DESCRIPTOR_HINTS.iter().any(|hint| lower.contains(hint))
}

fn cache_key(event: &ChangeEvent, health: &HashMap<WorkerKind, WorkerHealth>) -> CacheKey {
    let mut identities: Vec<WorkerKind> = health.keys().copied().collect();
    identities.sort();
    let total_depth: usize = health.values().map(|h| h.queue_depth).sum();
    CacheKey {
        repo: event.repo.clone(),
        branch: event.branch.clone(),
        file_bucket: match event.file_count() {
            0..=4 => 0,
            5..=19 => 1,
            _ => 2,
        },
        identities,
        load_bucket: match total_depth {
            0..=2 => 0,
            3..=9 => 1,
            _ => 2,
        },
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
