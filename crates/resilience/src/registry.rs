// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named breaker registry.
//!
//! One registry per runtime (injected, not global): call-sites obtain
//! a breaker by name and inherit the registry's default thresholds.

use crate::breaker::CircuitBreaker;
use crew_core::{BreakerConfig, BreakerHealth, Clock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub struct BreakerRegistry<C: Clock> {
    defaults: BreakerConfig,
    clock: C,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker<C>>>>,
}

impl<C: Clock> BreakerRegistry<C> {
    pub fn new(defaults: BreakerConfig, clock: C) -> Self {
        Self { defaults, clock, breakers: Mutex::new(HashMap::new()) }
    }

    /// Get the breaker named `name`, creating it with the registry
    /// defaults on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker<C>> {
        let mut breakers = self.breakers.lock();
        match breakers.get(name) {
            Some(breaker) => Arc::clone(breaker),
            None => {
                let breaker = Arc::new(CircuitBreaker::new(
                    name,
                    self.defaults.clone(),
                    self.clock.clone(),
                ));
                breakers.insert(name.to_string(), Arc::clone(&breaker));
                breaker
            }
        }
    }

    /// Create (or replace) a breaker with non-default thresholds.
    pub fn install(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker<C>> {
        let breaker = Arc::new(CircuitBreaker::new(name, config, self.clock.clone()));
        self.breakers.lock().insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Health view over every registered breaker.
    pub fn snapshot(&self) -> HashMap<String, BreakerHealth> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(name, breaker)| {
                let metrics = breaker.metrics();
                (
                    name.clone(),
                    BreakerHealth {
                        state: breaker.state().as_str().to_string(),
                        failures: metrics.failures,
                        state_changes: metrics.state_changes,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
