//! Failure handling building blocks
//!
//! - [`classifier`] - Raw failure signal to [`ErrorKind`](crate::models::ErrorKind)
//! - [`recovery`] - Error kind and retry count to delay and side effect
//! - [`circuit`] - Per-target circuit breaker
//! - [`rate_limit`] - Per-target minimum access gap

pub mod circuit;
pub mod classifier;
pub mod rate_limit;
pub mod recovery;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureOutcome, TripEvent, TripReason};
pub use classifier::{ErrorClassifier, FailureSignal};
pub use rate_limit::DomainRateLimiter;
pub use recovery::{RecoveryConfig, RecoveryDelay, RecoveryEffect, RecoveryPlan, RecoveryPolicy};
