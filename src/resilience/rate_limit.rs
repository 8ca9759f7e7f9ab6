//! Per-target minimum-gap rate limiting
//!
//! The gap applies per target type, not per account, so several accounts
//! never hit the same site back to back.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::utils::{from_unix_secs, to_unix_secs};

/// Default minimum gap between two accesses to the same target
pub const DEFAULT_MIN_GAP_SECS: i64 = 45;

/// Enforces a minimum gap between accesses to the same target
#[derive(Debug, Clone)]
pub struct DomainRateLimiter {
    min_gap: Duration,
    last_access: HashMap<String, DateTime<Utc>>,
}

impl Default for DomainRateLimiter {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_MIN_GAP_SECS))
    }
}

impl DomainRateLimiter {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_access: HashMap::new(),
        }
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Time left before `target` may be accessed again (zero if allowed now)
    pub fn get_delay_at(&self, target: &str, now: DateTime<Utc>) -> Duration {
        match self.last_access.get(target) {
            Some(last) => {
                let elapsed = now - *last;
                if elapsed >= self.min_gap {
                    Duration::zero()
                } else {
                    self.min_gap - elapsed
                }
            }
            None => Duration::zero(),
        }
    }

    /// Seconds left before `target` may be accessed again
    pub fn get_delay(&self, target: &str) -> f64 {
        self.get_delay_at(target, Utc::now()).num_milliseconds() as f64 / 1000.0
    }

    pub fn record_access_at(&mut self, target: &str, now: DateTime<Utc>) {
        self.last_access.insert(target.to_string(), now);
    }

    pub fn record_access(&mut self, target: &str) {
        self.record_access_at(target, Utc::now());
    }

    /// Last-access map as float unix timestamps, for the session file
    pub fn export(&self) -> HashMap<String, f64> {
        self.last_access
            .iter()
            .map(|(target, at)| (target.clone(), to_unix_secs(*at)))
            .collect()
    }

    /// Replace the last-access map from the session file, skipping bad entries
    pub fn import(&mut self, entries: &HashMap<String, f64>) {
        self.last_access = entries
            .iter()
            .filter_map(|(target, secs)| from_unix_secs(*secs).map(|at| (target.clone(), at)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_unknown_target_allowed() {
        let limiter = DomainRateLimiter::default();
        assert_eq!(limiter.get_delay_at("siteA", now()), Duration::zero());
    }

    #[test]
    fn test_gap_enforced() {
        let mut limiter = DomainRateLimiter::default();
        limiter.record_access_at("siteA", now());

        assert_eq!(
            limiter.get_delay_at("siteA", now() + Duration::seconds(10)),
            Duration::seconds(35)
        );
        assert_eq!(
            limiter.get_delay_at("siteA", now() + Duration::seconds(45)),
            Duration::zero()
        );
        // Other targets are unaffected
        assert_eq!(limiter.get_delay_at("siteB", now()), Duration::zero());
    }

    #[test]
    fn test_export_import() {
        let mut limiter = DomainRateLimiter::default();
        limiter.record_access_at("siteA", now());

        let exported = limiter.export();
        assert_eq!(exported.get("siteA"), Some(&1_700_000_000.0));

        let mut restored = DomainRateLimiter::default();
        restored.import(&exported);
        assert_eq!(
            restored.get_delay_at("siteA", now() + Duration::seconds(5)),
            Duration::seconds(40)
        );
    }
}
