//! Periodic substrate liveness checks
//!
//! The monitor owns the restart bookkeeping for the substrate, so restarts
//! triggered by repeated job exceptions go through it as well.

use std::time::Duration;
use tokio::time::Instant;

use super::substrate::{BrowserSubstrate, SubstrateError};

/// Default time between substrate health checks
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(600);

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    Healthy,
    Restarted,
    RestartFailed(String),
}

/// Counters reported in status snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub checks: u64,
    pub failed_checks: u64,
    pub restarts: u64,
    pub failed_restarts: u64,
}

#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    last_check: Option<Instant>,
    last_healthy: Option<bool>,
    stats: HealthStats,
    start_time: Instant,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_INTERVAL)
    }
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            // First check is one interval after start
            last_check: Some(now),
            last_healthy: None,
            stats: HealthStats::default(),
            start_time: now,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_check
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    /// Check the substrate and restart it if the check fails
    pub async fn check<S: BrowserSubstrate>(&mut self, substrate: &S) -> HealthCheckOutcome {
        self.last_check = Some(Instant::now());
        self.stats.checks += 1;

        let healthy = substrate.check_health().await;
        self.last_healthy = Some(healthy);
        if healthy {
            tracing::debug!("Substrate health check passed");
            return HealthCheckOutcome::Healthy;
        }

        self.stats.failed_checks += 1;
        tracing::warn!("Substrate health check failed, restarting");
        match self.restart(substrate, "health check failed").await {
            Ok(()) => HealthCheckOutcome::Restarted,
            Err(e) => HealthCheckOutcome::RestartFailed(e.to_string()),
        }
    }

    /// Restart the substrate and record the attempt
    pub async fn restart<S: BrowserSubstrate>(
        &mut self,
        substrate: &S,
        reason: &str,
    ) -> Result<(), SubstrateError> {
        match substrate.restart().await {
            Ok(()) => {
                self.stats.restarts += 1;
                tracing::warn!(reason = reason, restarts = self.stats.restarts, "Substrate restarted");
                Ok(())
            }
            Err(e) => {
                self.stats.failed_restarts += 1;
                tracing::error!(reason = reason, error = %e, "Substrate restart failed");
                Err(e)
            }
        }
    }

    pub fn last_healthy(&self) -> Option<bool> {
        self.last_healthy
    }

    pub fn stats(&self) -> HealthStats {
        self.stats
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
