//! Per-target circuit breaker
//!
//! Counts trip-worthy failures per target and opens the circuit for a cooldown
//! period once the threshold is reached. Which failures count depends on the
//! error kind: transient glitches never count, permanent failures always do,
//! and proxy issues only count once they recur for the same target.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::models::ErrorKind;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Trip-worthy failures before the circuit opens
    pub failure_threshold: u32,

    /// How long an opened circuit stays open (seconds)
    pub cooldown_secs: i64,

    /// Capacity of the recent error-kind ring buffer
    pub history_capacity: usize,

    /// Occurrences of `ProxyIssue` within the buffer needed before it counts
    pub proxy_issue_min_occurrences: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 4 * 3600,
            history_capacity: 10,
            proxy_issue_min_occurrences: 3,
        }
    }
}

// ============================================================================
// Circuit State
// ============================================================================

/// Breaker state for one target
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub failure_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub recent_errors: VecDeque<ErrorKind>,
}

impl CircuitState {
    fn push_error(&mut self, kind: ErrorKind, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.recent_errors.len() >= capacity {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(kind);
    }

    fn occurrences(&self, kind: ErrorKind) -> usize {
        self.recent_errors.iter().filter(|k| **k == kind).count()
    }
}

/// Why a circuit was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripReason {
    /// Failure threshold reached
    Threshold,
    /// Opened directly by the recovery policy (target down)
    Forced,
}

/// Record of one circuit opening
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripEvent {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub kind: ErrorKind,
    pub reason: TripReason,
    pub cooldown_until: DateTime<Utc>,
}

/// Effect of recording one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureOutcome {
    /// The failure counted toward the threshold
    pub counted: bool,
    /// This failure opened the circuit
    pub opened: bool,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Error-kind-aware circuit breaker keyed by target type
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: HashMap<String, CircuitState>,
    history: Vec<TripEvent>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Decide whether a failure of `kind` counts toward opening the circuit.
    ///
    /// Evaluated against the recorded history, which already contains the
    /// failure being judged when called from [`CircuitBreaker::record_failure_at`].
    pub fn should_trip(&self, target: &str, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::Transient => false,
            ErrorKind::Permanent => true,
            ErrorKind::ProxyIssue => self
                .states
                .get(target)
                .map(|s| s.occurrences(ErrorKind::ProxyIssue))
                .unwrap_or(0)
                >= self.config.proxy_issue_min_occurrences,
            _ => true,
        }
    }

    /// Record a failure now
    pub fn record_failure(&mut self, target: &str, kind: ErrorKind) -> FailureOutcome {
        self.record_failure_at(target, kind, Utc::now())
    }

    /// Record a failure at `now`
    pub fn record_failure_at(
        &mut self,
        target: &str,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let capacity = self.config.history_capacity;
        self.states
            .entry(target.to_string())
            .or_default()
            .push_error(kind, capacity);

        if !self.should_trip(target, kind) {
            tracing::debug!(target_type = %target, kind = %kind, "Failure recorded, not trip-worthy");
            return FailureOutcome::default();
        }

        let threshold = self.config.failure_threshold;
        let cooldown = Duration::seconds(self.config.cooldown_secs);

        let Some(state) = self.states.get_mut(target) else {
            return FailureOutcome::default();
        };
        state.failure_count += 1;

        let already_open = state.cooldown_until.is_some_and(|until| until > now);
        if state.failure_count < threshold || already_open {
            tracing::debug!(
                target_type = %target,
                kind = %kind,
                failures = state.failure_count,
                threshold = threshold,
                "Trip-worthy failure counted"
            );
            return FailureOutcome {
                counted: true,
                opened: false,
            };
        }

        let until = now + cooldown;
        state.cooldown_until = Some(until);
        let failures = state.failure_count;

        tracing::warn!(
            target_type = %target,
            kind = %kind,
            failures = failures,
            cooldown_until = %until,
            "Circuit opened"
        );
        self.history.push(TripEvent {
            timestamp: now,
            target: target.to_string(),
            kind,
            reason: TripReason::Threshold,
            cooldown_until: until,
        });

        FailureOutcome {
            counted: true,
            opened: true,
        }
    }

    /// Success clears the recent error history and the failure count
    pub fn record_success(&mut self, target: &str) {
        if let Some(state) = self.states.get_mut(target) {
            if state.failure_count > 0 || !state.recent_errors.is_empty() {
                tracing::debug!(target_type = %target, "Circuit history cleared after success");
            }
            state.recent_errors.clear();
            if state.cooldown_until.is_none() {
                state.failure_count = 0;
            }
        }
    }

    /// Open a target's circuit directly, bypassing the threshold
    pub fn force_open(&mut self, target: &str, kind: ErrorKind, duration: Duration, now: DateTime<Utc>) {
        let until = now + duration;
        let state = self.states.entry(target.to_string()).or_default();

        // Never shorten an existing cooldown
        if state.cooldown_until.is_some_and(|existing| existing >= until) {
            return;
        }
        state.cooldown_until = Some(until);

        tracing::warn!(
            target_type = %target,
            kind = %kind,
            cooldown_until = %until,
            "Circuit forced open"
        );
        self.history.push(TripEvent {
            timestamp: now,
            target: target.to_string(),
            kind,
            reason: TripReason::Forced,
            cooldown_until: until,
        });
    }

    /// Check if a target's circuit is open now
    pub fn is_open(&mut self, target: &str) -> bool {
        self.is_open_at(target, Utc::now())
    }

    /// Check if a target's circuit is open at `now`.
    ///
    /// The first check after the cooldown has elapsed closes the circuit and
    /// resets its failure count; later checks see a plain closed circuit.
    pub fn is_open_at(&mut self, target: &str, now: DateTime<Utc>) -> bool {
        let Some(state) = self.states.get_mut(target) else {
            return false;
        };

        match state.cooldown_until {
            Some(until) if until > now => true,
            Some(_) => {
                state.cooldown_until = None;
                state.failure_count = 0;
                tracing::info!(target_type = %target, "Circuit cooldown elapsed, target recovered");
                false
            }
            None => false,
        }
    }

    /// Cooldown end for an open circuit
    pub fn cooldown_until(&self, target: &str) -> Option<DateTime<Utc>> {
        self.states.get(target).and_then(|s| s.cooldown_until)
    }

    /// Targets whose circuit is open at `now`
    pub fn open_targets(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let mut open: Vec<_> = self
            .states
            .iter()
            .filter_map(|(target, s)| match s.cooldown_until {
                Some(until) if until > now => Some((target.clone(), until)),
                _ => None,
            })
            .collect();
        open.sort();
        open
    }

    pub fn state(&self, target: &str) -> Option<&CircuitState> {
        self.states.get(target)
    }

    /// Get trip history
    pub fn history(&self) -> &[TripEvent] {
        &self.history
    }
}

// ============================================================================
// Tests
// ============================================================================
