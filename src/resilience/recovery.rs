//! Recovery policy for failed jobs
//!
//! Turns an [`ErrorKind`] and the job's retry count into a delay, a
//! human-readable action and, for some kinds, a side effect the scheduler must
//! apply (burning a proxy, opening a target's circuit).

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::ErrorKind;

/// Configuration for recovery delays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay for transient errors after the first immediate retry
    pub transient_retry_secs: i64,

    /// Escalating delays for rate-limited jobs, indexed by retry count
    pub rate_limited_backoff_secs: Vec<i64>,

    pub proxy_issue_secs: i64,
    pub target_down_secs: i64,
    pub captcha_failed_secs: i64,
    pub config_error_secs: i64,
    pub unknown_secs: i64,

    /// Jitter bounds added to non-privileged, non-immediate delays
    pub jitter_min_secs: i64,
    pub jitter_max_secs: i64,

    /// Retry budget; a job failing more often than this is dropped
    pub max_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            transient_retry_secs: 300,
            rate_limited_backoff_secs: vec![600, 1800, 7200],
            proxy_issue_secs: 1800,
            target_down_secs: 14_400,
            captcha_failed_secs: 900,
            config_error_secs: 3600,
            unknown_secs: 600,
            jitter_min_secs: 30,
            jitter_max_secs: 120,
            max_retries: 10,
        }
    }
}

/// When a failed job may run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDelay {
    /// Re-enqueue after the given delay (zero means immediately)
    RetryAfter(Duration),
    /// Do not re-enqueue
    Never,
}

impl RecoveryDelay {
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }

    /// Delay in whole seconds, `None` for [`RecoveryDelay::Never`]
    pub fn as_secs(&self) -> Option<i64> {
        match self {
            Self::RetryAfter(d) => Some(d.num_seconds()),
            Self::Never => None,
        }
    }
}

/// Side effect a recovery decision requires beyond rescheduling the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEffect {
    /// Burn the proxy the job ran through
    BurnProxy,
    /// Open the target's circuit for the given duration
    SuspendTarget(Duration),
}

/// Outcome of the recovery policy for one failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub kind: ErrorKind,
    pub delay: RecoveryDelay,
    pub action: &'static str,
    pub effect: Option<RecoveryEffect>,
}

/// Maps error kinds to recovery plans
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Check whether a job with this retry count has used up its budget
    pub fn budget_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.config.max_retries
    }

    /// Base plan for a failure, without jitter.
    ///
    /// `retry_count` is the job's count before this failure is recorded.
    pub fn delay_for(&self, kind: ErrorKind, retry_count: u32) -> RecoveryPlan {
        let secs = Duration::seconds;
        let (delay, action, effect) = match kind {
            ErrorKind::Transient if retry_count == 0 => (
                RecoveryDelay::RetryAfter(Duration::zero()),
                "retry immediately",
                None,
            ),
            ErrorKind::Transient => (
                RecoveryDelay::RetryAfter(secs(self.config.transient_retry_secs)),
                "retry after short pause",
                None,
            ),
            ErrorKind::RateLimited => (
                RecoveryDelay::RetryAfter(secs(self.rate_limited_secs(retry_count))),
                "back off exponentially",
                None,
            ),
            ErrorKind::ProxyIssue => (
                RecoveryDelay::RetryAfter(secs(self.config.proxy_issue_secs)),
                "burn proxy and rotate",
                Some(RecoveryEffect::BurnProxy),
            ),
            ErrorKind::Permanent => (RecoveryDelay::Never, "drop job, needs manual review", None),
            ErrorKind::TargetDown => {
                let d = secs(self.config.target_down_secs);
                (
                    RecoveryDelay::RetryAfter(d),
                    "suspend target until it recovers",
                    Some(RecoveryEffect::SuspendTarget(d)),
                )
            }
            ErrorKind::CaptchaFailed => (
                RecoveryDelay::RetryAfter(secs(self.config.captcha_failed_secs)),
                "retry captcha later",
                None,
            ),
            ErrorKind::ConfigError => (
                RecoveryDelay::RetryAfter(secs(self.config.config_error_secs)),
                "operator intervention required",
                None,
            ),
            ErrorKind::Unknown => (
                RecoveryDelay::RetryAfter(secs(self.config.unknown_secs)),
                "retry after default delay",
                None,
            ),
        };

        RecoveryPlan {
            kind,
            delay,
            action,
            effect,
        }
    }

    /// Full plan including jitter for non-privileged jobs
    pub fn plan<R: Rng>(
        &self,
        kind: ErrorKind,
        retry_count: u32,
        privileged: bool,
        rng: &mut R,
    ) -> RecoveryPlan {
        let mut plan = self.delay_for(kind, retry_count);
        if privileged {
            return plan;
        }

        if let RecoveryDelay::RetryAfter(d) = plan.delay {
            if d > Duration::zero() {
                plan.delay = RecoveryDelay::RetryAfter(d + self.jitter(rng));
            }
        }
        plan
    }

    fn rate_limited_secs(&self, retry_count: u32) -> i64 {
        let table = &self.config.rate_limited_backoff_secs;
        match table.len() {
            0 => self.config.unknown_secs,
            len => table[(retry_count as usize).min(len - 1)],
        }
    }

    fn jitter<R: Rng>(&self, rng: &mut R) -> Duration {
        let lo = self.config.jitter_min_secs.max(0);
        let hi = self.config.jitter_max_secs.max(lo);
        Duration::seconds(rng.gen_range(lo..=hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn secs(plan: &RecoveryPlan) -> i64 {
        plan.delay.as_secs().expect("finite delay")
    }

    #[test]
    fn test_transient_first_retry_is_immediate() {
        let policy = RecoveryPolicy::default();
        assert_eq!(secs(&policy.delay_for(ErrorKind::Transient, 0)), 0);
        assert_eq!(secs(&policy.delay_for(ErrorKind::Transient, 1)), 300);
        assert_eq!(secs(&policy.delay_for(ErrorKind::Transient, 7)), 300);
    }

    #[test]
    fn test_rate_limited_escalates_and_caps() {
        let policy = RecoveryPolicy::default();
        let delays: Vec<i64> = (0..5)
            .map(|n| secs(&policy.delay_for(ErrorKind::RateLimited, n)))
            .collect();
        assert_eq!(delays, vec![600, 1800, 7200, 7200, 7200]);
    }

    #[test]
    fn test_permanent_never_retries() {
        let policy = RecoveryPolicy::default();
        let plan = policy.delay_for(ErrorKind::Permanent, 0);
        assert!(plan.delay.is_never());
        assert_eq!(plan.delay.as_secs(), None);
    }

    #[test]
    fn test_side_effects() {
        let policy = RecoveryPolicy::default();
        assert_eq!(
            policy.delay_for(ErrorKind::ProxyIssue, 0).effect,
            Some(RecoveryEffect::BurnProxy)
        );
        assert_eq!(
            policy.delay_for(ErrorKind::TargetDown, 0).effect,
            Some(RecoveryEffect::SuspendTarget(Duration::seconds(14_400)))
        );
        assert_eq!(policy.delay_for(ErrorKind::CaptchaFailed, 0).effect, None);
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RecoveryPolicy::default();
        assert_eq!(secs(&policy.delay_for(ErrorKind::ProxyIssue, 3)), 1800);
        assert_eq!(secs(&policy.delay_for(ErrorKind::TargetDown, 0)), 14_400);
        assert_eq!(secs(&policy.delay_for(ErrorKind::CaptchaFailed, 0)), 900);
        assert_eq!(secs(&policy.delay_for(ErrorKind::Unknown, 0)), 600);
        assert_eq!(secs(&policy.delay_for(ErrorKind::ConfigError, 0)), 3600);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RecoveryPolicy::default();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let plan = policy.plan(ErrorKind::Unknown, 0, false, &mut rng);
            let d = secs(&plan);
            assert!((630..=720).contains(&d), "jittered delay {d} out of range");
        }
    }

    #[test]
    fn test_no_jitter_for_immediate_or_privileged() {
        let policy = RecoveryPolicy::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let immediate = policy.plan(ErrorKind::Transient, 0, false, &mut rng);
        assert_eq!(secs(&immediate), 0);

        let withdraw = policy.plan(ErrorKind::RateLimited, 1, true, &mut rng);
        assert_eq!(secs(&withdraw), 1800);

        let permanent = policy.plan(ErrorKind::Permanent, 0, false, &mut rng);
        assert!(permanent.delay.is_never());
    }

    #[test]
    fn test_budget_exhausted() {
        let policy = RecoveryPolicy::new(RecoveryConfig {
            max_retries: 2,
            ..Default::default()
        });
        assert!(!policy.budget_exhausted(2));
        assert!(policy.budget_exhausted(3));
    }
}
