// Core data structures for the claimfleet scheduler

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Operation names that move funds out of an account.
///
/// Privileged jobs never get jitter added to their retry delays.
pub const PRIVILEGED_OPERATIONS: &[&str] = &["withdraw"];

// ============================================================================
// Error Kind
// ============================================================================

/// Closed set of failure kinds the resilience engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Short-lived glitch (closed page, timeout, reset connection)
    Transient,
    /// Target asked us to slow down
    RateLimited,
    /// Proxy was refused or detected
    ProxyIssue,
    /// Account banned or credentials invalid; never retried
    Permanent,
    /// Target is returning server errors
    TargetDown,
    /// Captcha could not be solved in time
    CaptchaFailed,
    /// Local misconfiguration that needs an operator
    ConfigError,
    /// Nothing matched
    Unknown,
}

impl ErrorKind {
    /// Get all kinds
    pub fn all() -> Vec<Self> {
        vec![
            Self::Transient,
            Self::RateLimited,
            Self::ProxyIssue,
            Self::Permanent,
            Self::TargetDown,
            Self::CaptchaFailed,
            Self::ConfigError,
            Self::Unknown,
        ]
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::ProxyIssue => "proxy_issue",
            Self::Permanent => "permanent",
            Self::TargetDown => "target_down",
            Self::CaptchaFailed => "captcha_failed",
            Self::ConfigError => "config_error",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "transient" => Some(Self::Transient),
            "rate_limited" | "ratelimited" => Some(Self::RateLimited),
            "proxy_issue" | "proxy" => Some(Self::ProxyIssue),
            "permanent" => Some(Self::Permanent),
            "target_down" | "down" => Some(Self::TargetDown),
            "captcha_failed" | "captcha" => Some(Self::CaptchaFailed),
            "config_error" | "config" => Some(Self::ConfigError),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Account Profile
// ============================================================================

/// Proxy selection strategy configured per account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    HealthBased,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::HealthBased => "health_based",
        }
    }
}

/// External account a job runs as
///
/// Owned by the caller; the scheduler only reads it. Serialized verbatim into
/// the session file so jobs can be restored without the caller's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Stable label used in logs, cookie storage and concurrency accounting
    pub label: String,

    /// Proxy pool for this account
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Proxy used when every pool entry is unhealthy
    #[serde(default)]
    pub fallback_proxy: Option<String>,

    #[serde(default)]
    pub rotation: RotationStrategy,

    /// Overrides the scheduler-wide per-account concurrency limit
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl AccountProfile {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            proxies: Vec::new(),
            fallback_proxy: None,
            rotation: RotationStrategy::default(),
            max_concurrent: None,
        }
    }

    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, proxy: impl Into<String>) -> Self {
        self.fallback_proxy = Some(proxy.into());
        self
    }

    pub fn with_rotation(mut self, rotation: RotationStrategy) -> Self {
        self.rotation = rotation;
        self
    }
}

// ============================================================================
// Job
// ============================================================================

/// One scheduled unit of work against a target for an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Lower runs first
    pub priority: i32,

    /// Earliest time the job may be dispatched
    pub next_run: DateTime<Utc>,

    pub name: String,
    pub account: AccountProfile,
    pub target_type: String,
    pub operation: String,

    #[serde(default)]
    pub retry_count: u32,
}

impl Job {
    /// Create a job that is ready immediately
    pub fn new(
        name: impl Into<String>,
        account: AccountProfile,
        target_type: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: 0,
            next_run: Utc::now(),
            name: name.into(),
            account,
            target_type: target_type.into(),
            operation: operation.into(),
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_next_run(mut self, next_run: DateTime<Utc>) -> Self {
        self.next_run = next_run;
        self
    }

    /// Check if the job may run at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_run <= now
    }

    /// Check if the operation moves funds (no retry jitter)
    pub fn is_privileged(&self) -> bool {
        PRIVILEGED_OPERATIONS.contains(&self.operation.as_str())
    }

    /// Push `next_run` to `now + delay`, saturating at the latest
    /// representable time
    pub fn reschedule(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.next_run = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Scheduling order: priority ascending, then `next_run` ascending.
    ///
    /// Name and id break remaining ties so the order is total.
    pub fn schedule_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.next_run.cmp(&other.next_run))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.id.cmp(&other.id))
    }
}

// ============================================================================
// Work Result
// ============================================================================

/// Facts a worker reports after running an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub success: bool,
    pub status: String,

    /// Worker's suggestion for when to run this job again
    pub next_delay_minutes: f64,

    /// Set when the worker already knows why it failed
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl WorkResult {
    pub fn success(status: impl Into<String>, next_delay_minutes: f64) -> Self {
        Self {
            success: true,
            status: status.into(),
            next_delay_minutes,
            error_kind: None,
        }
    }

    /// Failure whose kind is left to the classifier
    pub fn failure(status: impl Into<String>) -> Self {
        Self {
            success: false,
            status: status.into(),
            next_delay_minutes: 0.0,
            error_kind: None,
        }
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }
}

/// Error raised by a worker operation instead of returning a result
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,

    /// Known kind, skips classification
    pub kind: Option<ErrorKind>,

    /// HTTP status seen by the worker, if any
    pub http_status: Option<u16>,

    /// Page text captured at failure time, if any
    pub page_content: Option<String>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            http_status: None,
            page_content: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_page_content(mut self, content: impl Into<String>) -> Self {
        self.page_content = Some(content.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, priority: i32, offset_secs: i64) -> Job {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Job::new(name, AccountProfile::new("acct"), "siteA", "claim")
            .with_priority(priority)
            .with_next_run(base + Duration::seconds(offset_secs))
    }

    #[test]
    fn test_schedule_order_priority_first() {
        let a = job("a", 1, 100);
        let b = job("b", 2, 0);
        assert_eq!(a.schedule_cmp(&b), Ordering::Less);
    }

    #[test]
    fn test_schedule_order_next_run_breaks_ties() {
        let a = job("a", 1, 10);
        let b = job("b", 1, 5);
        assert_eq!(a.schedule_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn test_is_ready() {
        let j = job("a", 0, 0);
        assert!(j.is_ready(j.next_run));
        assert!(!j.is_ready(j.next_run - Duration::seconds(1)));
    }

    #[test]
    fn test_reschedule_saturates_instead_of_overflowing() {
        let mut j = job("a", 0, 0);
        let now = j.next_run;
        j.reschedule(now, Duration::seconds(90));
        assert_eq!(j.next_run, now + Duration::seconds(90));

        j.reschedule(now, Duration::days(365 * 300_000));
        assert_eq!(j.next_run, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_privileged_operation() {
        let mut j = job("a", 0, 0);
        assert!(!j.is_privileged());
        j.operation = "withdraw".to_string();
        assert!(j.is_privileged());
    }

    #[test]
    fn test_error_kind_parse_roundtrip() {
        for kind in ErrorKind::all() {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nonsense"), None);
    }

    #[test]
    fn test_account_profile_deserialize_defaults() {
        let account: AccountProfile = serde_json::from_str(r#"{"label":"alice"}"#).unwrap();
        assert_eq!(account.label, "alice");
        assert!(account.proxies.is_empty());
        assert_eq!(account.rotation, RotationStrategy::RoundRobin);
    }

    #[test]
    fn test_work_result_builders() {
        let ok = WorkResult::success("claimed", 60.0);
        assert!(ok.success);
        assert!(ok.error_kind.is_none());

        let failed = WorkResult::failure("banned").with_error_kind(ErrorKind::Permanent);
        assert!(!failed.success);
        assert_eq!(failed.error_kind, Some(ErrorKind::Permanent));
    }
}
