//! Interfaces to the browser execution substrate and its helpers
//!
//! The scheduler never drives a browser itself. It asks a
//! [`BrowserSubstrate`] for one isolated session per job, hands the session's
//! page to the registered operation, and releases the session afterwards.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::AccountProfile;

/// Result type for substrate calls
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Errors raised by the browser substrate
#[derive(Error, Debug, Clone)]
pub enum SubstrateError {
    #[error("Failed to create session: {0}")]
    SessionCreation(String),

    #[error("Failed to open page: {0}")]
    Page(String),

    #[error("Substrate restart failed: {0}")]
    Restart(String),

    #[error("Failed to save cookies: {0}")]
    Cookies(String),

    #[error("Failed to close session: {0}")]
    Close(String),

    #[error("Substrate unavailable: {0}")]
    Unavailable(String),
}

/// Options for creating one isolated browser session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub proxy: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub account_label: String,
}

impl SessionOptions {
    pub fn new(account_label: impl Into<String>) -> Self {
        Self {
            account_label: account_label.into(),
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_geo(mut self, hint: Option<GeoHint>) -> Self {
        if let Some(hint) = hint {
            self.locale = Some(hint.locale);
            self.timezone = Some(hint.timezone_id);
        }
        self
    }
}

/// Health signals read from a page after an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStatus {
    /// The site blocked or flagged the session
    pub blocked: bool,

    /// The page hit a network-level failure
    pub network_error: bool,
}

/// Browser automation backend
///
/// `Session` and `Page` are opaque to the scheduler; they only travel
/// between the substrate and the registered operations.
#[async_trait]
pub trait BrowserSubstrate: Send + Sync + 'static {
    type Session: Send + Sync + 'static;
    type Page: Send + Sync + 'static;

    async fn create_session(&self, options: &SessionOptions) -> SubstrateResult<Self::Session>;

    async fn new_page(&self, session: &Self::Session) -> SubstrateResult<Self::Page>;

    async fn check_page_status(&self, page: &Self::Page) -> PageStatus;

    /// Liveness check for the whole substrate
    async fn check_health(&self) -> bool;

    async fn restart(&self) -> SubstrateResult<()>;

    async fn save_cookies(&self, session: &Self::Session, account_label: &str) -> SubstrateResult<()>;

    async fn close(&self, session: Self::Session) -> SubstrateResult<()>;
}

// ============================================================================
// Geolocation
// ============================================================================

/// Locale and timezone matching a proxy's exit location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoHint {
    pub timezone_id: String,
    pub locale: String,
}

/// Looks up where a proxy exits
#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn geolocation_for_proxy(&self, proxy: &str) -> Option<GeoHint>;
}

// ============================================================================
// Account Suspension
// ============================================================================

/// Decides whether an account is held back from a target
///
/// Consulted synchronously during admission, so implementations should
/// answer from cached state.
pub trait SuspendPolicy: Send + Sync {
    fn should_suspend(&self, account: &AccountProfile, target_type: &str) -> bool;
}

/// Policy that never suspends
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSuspend;

impl SuspendPolicy for NeverSuspend {
    fn should_suspend(&self, _account: &AccountProfile, _target_type: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_geo() {
        let opts = SessionOptions::new("alice")
            .with_proxy(Some("http://p1".to_string()))
            .with_geo(Some(GeoHint {
                timezone_id: "Europe/Berlin".to_string(),
                locale: "de-DE".to_string(),
            }));

        assert_eq!(opts.account_label, "alice");
        assert_eq!(opts.proxy.as_deref(), Some("http://p1"));
        assert_eq!(opts.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(opts.locale.as_deref(), Some("de-DE"));
    }

    #[test]
    fn test_no_geo_leaves_hints_empty() {
        let opts = SessionOptions::new("alice").with_geo(None);
        assert!(opts.locale.is_none());
        assert!(opts.timezone.is_none());
    }

    #[test]
    fn test_never_suspend() {
        assert!(!NeverSuspend.should_suspend(&AccountProfile::new("a"), "siteA"));
    }
}
