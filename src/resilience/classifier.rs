//! Failure classification
//!
//! Maps raw failure signals (HTTP status, message text, page content) to an
//! [`ErrorKind`]. The mapping is deterministic and has no side effects, so it
//! can be called from anywhere, including tests and the operator CLI.
//!
//! Precedence, first match wins:
//!
//! 1. HTTP status
//! 2. Configuration phrases (missing API key, misconfigured captcha provider)
//! 3. Message text (closed session, captcha failure, timeout)
//! 4. Page content (ban, rate limit, proxy detection, challenge)
//! 5. [`ErrorKind::Unknown`]

use regex::Regex;
use std::sync::OnceLock;

use crate::models::{ErrorKind, ExecutionError};

/// Raw facts describing one failure
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureSignal<'a> {
    pub http_status: Option<u16>,
    pub message: Option<&'a str>,
    pub page_content: Option<&'a str>,
}

impl<'a> FailureSignal<'a> {
    pub fn from_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Default::default()
        }
    }

    pub fn from_message(message: &'a str) -> Self {
        Self {
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn from_content(content: &'a str) -> Self {
        Self {
            page_content: Some(content),
            ..Default::default()
        }
    }

    /// Worker status strings can carry either kind of text, so both stages see it
    pub fn from_status_text(text: &'a str) -> Self {
        Self {
            http_status: None,
            message: Some(text),
            page_content: Some(text),
        }
    }

    pub fn from_execution_error(err: &'a ExecutionError) -> Self {
        Self {
            http_status: err.http_status,
            message: Some(err.message.as_str()),
            page_content: err.page_content.as_deref(),
        }
    }
}

fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("Invalid regex pattern"))
}

fn config_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)(missing|no|invalid|empty) (captcha )?api[ _-]?key|api[ _-]?key (is )?(missing|not set|not configured)|captcha (provider|service|solver) (is )?(not configured|misconfigured|unavailable)|error_key_does_not_exist|error_wrong_user_key|error_zero_balance",
    )
}

fn closed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)target (page, context or browser )?(has been )?closed|(browser|page|context|session|connection) (has been |was )?closed",
    )
}

fn captcha_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)captcha.{0,40}(fail|timeout|timed out|unsolv|not solved|error)|(failed|unable) to solve.{0,20}captcha",
    )
}

fn timeout_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)timeout|timed out|connection reset|econnreset|err_connection_reset|err_timed_out",
    )
}

fn banned_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)account (has been |is )?(banned|suspended|disabled|terminated|locked)|you (have been|are) (banned|blocked permanently)|invalid (credentials|password|username|login)|incorrect (password|credentials)|wrong password",
    )
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)too many requests|rate[ _-]?limit|slow down|try again later",
    )
}

fn proxy_detected_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)(proxy|vpn|bot) (was |has been |is )?detected|using a (proxy|vpn)|automated (access|traffic|queries)|unusual traffic",
    )
}

fn challenge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?i)checking your browser|verify (that )?you are (a )?human|just a moment|cf-challenge|challenge-platform|attention required|security check",
    )
}

/// Stateless failure classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure signal
    pub fn classify(&self, signal: &FailureSignal<'_>) -> ErrorKind {
        if let Some(kind) = signal.http_status.and_then(Self::classify_http_status) {
            return kind;
        }

        let texts = [signal.message, signal.page_content];
        if texts.iter().flatten().any(|t| config_re().is_match(t)) {
            return ErrorKind::ConfigError;
        }

        if let Some(kind) = signal.message.and_then(Self::classify_message) {
            return kind;
        }

        if let Some(kind) = signal.page_content.and_then(Self::classify_content) {
            return kind;
        }

        ErrorKind::Unknown
    }

    /// Classify a worker status string
    pub fn classify_status_text(&self, text: &str) -> ErrorKind {
        self.classify(&FailureSignal::from_status_text(text))
    }

    /// Classify an execution error, honouring a kind the worker already set
    pub fn classify_execution_error(&self, err: &ExecutionError) -> ErrorKind {
        err.kind
            .unwrap_or_else(|| self.classify(&FailureSignal::from_execution_error(err)))
    }

    fn classify_http_status(status: u16) -> Option<ErrorKind> {
        match status {
            500 | 502 | 503 | 504 => Some(ErrorKind::TargetDown),
            429 => Some(ErrorKind::RateLimited),
            403 => Some(ErrorKind::ProxyIssue),
            _ => None,
        }
    }

    fn classify_message(message: &str) -> Option<ErrorKind> {
        if closed_re().is_match(message) {
            Some(ErrorKind::Transient)
        } else if captcha_re().is_match(message) {
            Some(ErrorKind::CaptchaFailed)
        } else if timeout_re().is_match(message) {
            Some(ErrorKind::Transient)
        } else {
            None
        }
    }

    fn classify_content(content: &str) -> Option<ErrorKind> {
        if banned_re().is_match(content) {
            Some(ErrorKind::Permanent)
        } else if rate_limit_re().is_match(content) {
            Some(ErrorKind::RateLimited)
        } else if proxy_detected_re().is_match(content) {
            Some(ErrorKind::ProxyIssue)
        } else if challenge_re().is_match(content) {
            // A challenge is pressure, not a block
            Some(ErrorKind::RateLimited)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classify(signal: FailureSignal<'_>) -> ErrorKind {
        ErrorClassifier::new().classify(&signal)
    }

    #[test]
    fn test_http_status_mapping() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify(FailureSignal::from_status(status)), ErrorKind::TargetDown);
        }
        assert_eq!(classify(FailureSignal::from_status(429)), ErrorKind::RateLimited);
        assert_eq!(classify(FailureSignal::from_status(403)), ErrorKind::ProxyIssue);
        assert_eq!(classify(FailureSignal::from_status(404)), ErrorKind::Unknown);
    }

    #[test]
    fn test_http_status_wins_over_text() {
        let signal = FailureSignal {
            http_status: Some(503),
            message: Some("Timeout 30000ms exceeded"),
            page_content: Some("Your account has been banned"),
        };
        assert_eq!(classify(signal), ErrorKind::TargetDown);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify(FailureSignal::from_message("Target page, context or browser has been closed")),
            ErrorKind::Transient
        );
        assert_eq!(
            classify(FailureSignal::from_message("Captcha solve timed out after 120s")),
            ErrorKind::CaptchaFailed
        );
        assert_eq!(
            classify(FailureSignal::from_message("net::ERR_CONNECTION_RESET at https://x")),
            ErrorKind::Transient
        );
        assert_eq!(
            classify(FailureSignal::from_message("Timeout 30000ms exceeded")),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_captcha_timeout_is_not_plain_timeout() {
        // captcha check runs before the generic timeout check
        assert_eq!(
            classify(FailureSignal::from_message("hCaptcha timeout")),
            ErrorKind::CaptchaFailed
        );
    }

    #[test]
    fn test_content_classification() {
        assert_eq!(
            classify(FailureSignal::from_content("Your account has been suspended.")),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify(FailureSignal::from_content("Invalid credentials, please retry")),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify(FailureSignal::from_content("Too many requests. Slow down!")),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(FailureSignal::from_content("VPN detected, disable it to continue")),
            ErrorKind::ProxyIssue
        );
        assert_eq!(
            classify(FailureSignal::from_content("Checking your browser before accessing")),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn test_config_error_precedence() {
        assert_eq!(
            classify(FailureSignal::from_message("Captcha solver failed: missing API key")),
            ErrorKind::ConfigError
        );
        let signal = FailureSignal {
            http_status: None,
            message: Some("solver returned ERROR_ZERO_BALANCE"),
            page_content: Some("account suspended"),
        };
        assert_eq!(classify(signal), ErrorKind::ConfigError);
    }

    #[test]
    fn test_unknown_fallback() {
        assert_eq!(classify(FailureSignal::default()), ErrorKind::Unknown);
        assert_eq!(
            classify(FailureSignal::from_message("element #claim not found")),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_execution_error_kind_is_honoured() {
        let classifier = ErrorClassifier::new();
        let err = ExecutionError::new("Timeout 30000ms exceeded").with_kind(ErrorKind::Permanent);
        assert_eq!(classifier.classify_execution_error(&err), ErrorKind::Permanent);

        let err = ExecutionError::new("upstream").with_status(502);
        assert_eq!(classifier.classify_execution_error(&err), ErrorKind::TargetDown);
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(text in ".{0,200}", status in proptest::option::of(100u16..600)) {
            let signal = FailureSignal {
                http_status: status,
                message: Some(text.as_str()),
                page_content: Some(text.as_str()),
            };
            let classifier = ErrorClassifier::new();
            prop_assert_eq!(classifier.classify(&signal), classifier.classify(&signal));
        }
    }
}
