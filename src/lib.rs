//! claimfleet - Fleet automation scheduler with resilience controls
//!
//! Runs many small browser-driven jobs (claims, check-ins, withdrawals) for a
//! fleet of accounts against a set of target sites, without tripping the
//! targets' defenses and without losing work across restarts.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Jobs, accounts, work results and error kinds
//! - [`scheduler`] - The scheduling loop, worker registry and browser substrate interface
//! - [`resilience`] - Error classification, recovery policy, circuit breaker and rate limiting
//! - [`proxy`] - Per-account proxy rotation and burn tracking
//! - [`storage`] - Session persistence and heartbeat file
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use claimfleet::config::Config;
//! use claimfleet::scheduler::{BrowserSubstrate, Scheduler, WorkerRegistry};
//!
//! async fn start<S: BrowserSubstrate>(substrate: Arc<S>, registry: WorkerRegistry<S::Page>) -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let mut scheduler = Scheduler::from_config(&config, substrate, registry)?;
//!     scheduler.restore()?;
//!     scheduler.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod resilience;
pub mod scheduler;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{AccountProfile, ErrorKind, ExecutionError, Job, RotationStrategy, WorkResult};
    pub use crate::scheduler::{
        BrowserSubstrate, Operation, PageStatus, Scheduler, SchedulerHandle, WorkerRegistry,
    };
    pub use crate::storage::SessionStore;
}

// Direct re-exports for convenience
pub use models::{AccountProfile, ErrorKind, Job, WorkResult};
