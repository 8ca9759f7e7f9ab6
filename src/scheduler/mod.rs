//! Job scheduling for the claim fleet
//!
//! # Overview
//!
//! Callers enqueue [`Job`](crate::models::Job) values. The scheduling loop
//! picks the ready ones in priority order, checks them against the
//! concurrency limits, the per-target rate limiter, the circuit breaker and
//! the account suspend policy, and runs each admitted job in its own browser
//! session. Results come back to the loop, which classifies failures, applies
//! the recovery policy and re-enqueues or drops the job.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────── Scheduler loop ────────────────────────────────┐
//! │                                                                                │
//! │  JobQueue ──► admission ──► JoinSet ──► JobOutcome ──► classify ──► recover    │
//! │     ▲          │  │  │                                                 │       │
//! │     │   rate limit │ suspend                        breaker / proxies / delay  │
//! │     │           breaker                                                │       │
//! │     └──────────────────────────────── re-enqueue ◄─────────────────────┘       │
//! │                                                                                │
//! │  maintenance: heartbeat (60s) · checkpoint (300s) · health check (600s)        │
//! └────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`engine`] - The scheduling loop, its configuration and handle
//! - [`queue`] - Pending job queue
//! - [`registry`] - `(target_type, operation)` to worker implementation
//! - [`substrate`] - Browser substrate, geolocation and suspend interfaces
//! - [`health`] - Periodic substrate health checks and restarts
//! - [`error`] - Scheduler error types

pub mod engine;
pub mod error;
pub mod health;
pub mod queue;
pub mod registry;
pub mod substrate;

pub use engine::{JobOutcome, RunError, Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStatus};
pub use error::{SchedulerError, SchedulerResult};
pub use health::{HealthCheckOutcome, HealthMonitor, HealthStats};
pub use queue::JobQueue;
pub use registry::{Operation, WorkerRegistry};
pub use substrate::{
    BrowserSubstrate, GeoHint, GeolocationProvider, NeverSuspend, PageStatus, SessionOptions,
    SubstrateError, SubstrateResult, SuspendPolicy,
};
