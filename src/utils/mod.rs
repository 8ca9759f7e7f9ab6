//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the application.

use chrono::{DateTime, Utc};

/// Convert a timestamp to float unix seconds (microsecond precision)
pub fn to_unix_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Convert float unix seconds back to a timestamp
///
/// Returns `None` for non-finite or out-of-range values.
pub fn from_unix_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round();
    if micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Truncate text to a maximum length (in characters) for log output
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

/// Format a number of seconds as a short human-readable span
pub fn format_secs(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{:02}s", s / 60, s % 60),
        s => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_secs_roundtrip() {
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let secs = to_unix_secs(at);
        assert!((secs - 1_700_000_000.25).abs() < 1e-6);
        assert_eq!(from_unix_secs(secs), Some(at));
    }

    #[test]
    fn test_from_unix_secs_rejects_garbage() {
        assert_eq!(from_unix_secs(f64::NAN), None);
        assert_eq!(from_unix_secs(f64::INFINITY), None);
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("very long text here", 10), "very lo...");
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(45), "45s");
        assert_eq!(format_secs(600), "10m00s");
        assert_eq!(format_secs(14_400), "4h00m");
    }
}
