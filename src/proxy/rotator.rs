//! Proxy health tracking and per-account rotation
//!
//! Each proxy carries a failure count and a burned flag. Selection filters an
//! account's pool down to usable proxies and then applies the account's
//! [`RotationStrategy`]. When nothing in the pool is usable the account's
//! fallback proxy is returned, even if it is failing itself: degraded service
//! beats no service.

use chrono::{DateTime, Duration, Utc};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{AccountProfile, RotationStrategy};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for proxy health tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Failures at which a proxy leaves rotation
    pub max_failures: u32,

    /// How long a detected proxy stays burned (seconds)
    pub burn_secs: i64,

    /// How long after its last failure a failing proxy is re-admitted (seconds)
    pub failure_cooldown_secs: i64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            burn_secs: 12 * 3600,
            failure_cooldown_secs: 1800,
        }
    }
}

// ============================================================================
// Proxy State
// ============================================================================

/// Health record for one proxy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyState {
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub burned: bool,
    pub burned_until: Option<DateTime<Utc>>,
}

impl ProxyState {
    fn is_usable(&self, max_failures: u32) -> bool {
        !self.burned && self.failure_count < max_failures
    }
}

// ============================================================================
// Proxy Rotator
// ============================================================================

/// Tracks proxy health and picks the next proxy for an account
#[derive(Debug)]
pub struct ProxyRotator {
    config: ProxyConfig,
    states: HashMap<String, ProxyState>,
    round_robin: HashMap<String, usize>,
    rng: ChaCha8Rng,
}

impl Default for ProxyRotator {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

impl ProxyRotator {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            round_robin: HashMap::new(),
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    /// Create with a fixed seed for the `random` strategy
    pub fn with_seed(config: ProxyConfig, seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            ..Self::new(config)
        }
    }

    /// Pick the next proxy for an account now
    pub fn next_proxy(&mut self, account: &AccountProfile) -> Option<String> {
        self.next_proxy_at(account, Utc::now())
    }

    /// Pick the next proxy for an account at `now`
    pub fn next_proxy_at(&mut self, account: &AccountProfile, now: DateTime<Utc>) -> Option<String> {
        for proxy in &account.proxies {
            self.expire(proxy, now);
        }

        let max_failures = self.config.max_failures;
        let usable: Vec<&String> = account
            .proxies
            .iter()
            .filter(|p| {
                self.states
                    .get(p.as_str())
                    .map_or(true, |s| s.is_usable(max_failures))
            })
            .collect();

        if usable.is_empty() {
            if !account.proxies.is_empty() {
                tracing::warn!(
                    account = %account.label,
                    fallback = ?account.fallback_proxy,
                    "No healthy proxy in pool, using fallback"
                );
            }
            return account.fallback_proxy.clone();
        }

        let picked = match account.rotation {
            RotationStrategy::RoundRobin => {
                let index = self.round_robin.entry(account.label.clone()).or_insert(0);
                let picked = usable[*index % usable.len()];
                *index = (*index + 1) % usable.len();
                picked
            }
            RotationStrategy::Random => usable
                .choose(&mut self.rng)
                .copied()
                .unwrap_or(usable[0]),
            RotationStrategy::HealthBased => usable
                .iter()
                .copied()
                .min_by_key(|p| {
                    let state = self.states.get(p.as_str());
                    (
                        state.map_or(0, |s| s.failure_count),
                        state.and_then(|s| s.last_failure_time),
                    )
                })
                .unwrap_or(usable[0]),
        };

        tracing::debug!(
            account = %account.label,
            strategy = account.rotation.as_str(),
            proxy = %picked,
            "Proxy selected"
        );
        Some(picked.clone())
    }

    /// Record a failure now
    pub fn record_failure(&mut self, proxy: &str, detected: bool) {
        self.record_failure_at(proxy, detected, Utc::now());
    }

    /// Record a proxy failure.
    ///
    /// `detected` means the target flagged the proxy itself, as opposed to a
    /// plain network failure; it burns the proxy regardless of its count.
    pub fn record_failure_at(&mut self, proxy: &str, detected: bool, now: DateTime<Utc>) {
        let burn = Duration::seconds(self.config.burn_secs);
        let state = self.states.entry(proxy.to_string()).or_default();
        state.failure_count += 1;
        state.last_failure_time = Some(now);

        if detected {
            let until = now + burn;
            state.burned = true;
            state.burned_until = Some(until);
            tracing::warn!(proxy = %proxy, burned_until = %until, "Proxy burned");
        } else {
            tracing::debug!(
                proxy = %proxy,
                failures = state.failure_count,
                "Proxy failure recorded"
            );
        }
    }

    /// A clean run resets the failure count of a non-burned proxy
    pub fn record_success(&mut self, proxy: &str) {
        if let Some(state) = self.states.get_mut(proxy) {
            if !state.burned {
                state.failure_count = 0;
            }
        }
    }

    pub fn is_burned(&self, proxy: &str) -> bool {
        self.states.get(proxy).is_some_and(|s| s.burned)
    }

    pub fn state(&self, proxy: &str) -> Option<&ProxyState> {
        self.states.get(proxy)
    }

    /// Proxies burned at `now`, sorted
    pub fn burned_proxies(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut burned: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| s.burned && s.burned_until.map_or(true, |until| until > now))
            .map(|(p, _)| p.clone())
            .collect();
        burned.sort();
        burned
    }

    fn expire(&mut self, proxy: &str, now: DateTime<Utc>) {
        let max_failures = self.config.max_failures;
        let cooldown = Duration::seconds(self.config.failure_cooldown_secs);
        let Some(state) = self.states.get_mut(proxy) else {
            return;
        };

        if state.burned {
            if state.burned_until.is_some_and(|until| until <= now) {
                *state = ProxyState::default();
                tracing::info!(proxy = %proxy, "Proxy burn window elapsed, back in rotation");
            }
            return;
        }

        let cooled = state
            .last_failure_time
            .is_some_and(|last| now - last >= cooldown);
        if state.failure_count >= max_failures && cooled {
            state.failure_count = 0;
            tracing::info!(proxy = %proxy, "Proxy failure cooldown elapsed, back in rotation");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
