//! Prometheus metrics for the scheduler
//!
//! Metrics live in an owned [`Registry`] rather than the process-global
//! default, so several schedulers (or tests) never collide on registration.
//! The scheduler takes an `Arc<SchedulerMetrics>` at construction; without
//! one every recording call is skipped.
//!
//! # Example
//!
//! ```no_run
//! use claimfleet::metrics::SchedulerMetrics;
//!
//! let metrics = SchedulerMetrics::new().expect("metric names are static");
//! metrics.record_dispatch("siteA");
//! println!("{}", metrics.render().unwrap_or_default());
//! ```

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::models::ErrorKind;

const NAMESPACE: &str = "claimfleet";

/// Job duration buckets in seconds
const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0];

// ============================================================================
// Metrics Storage
// ============================================================================

/// Counters, gauges and histograms for one scheduler
pub struct SchedulerMetrics {
    registry: Registry,
    jobs_dispatched: CounterVec,
    job_outcomes: CounterVec,
    error_kinds: CounterVec,
    dispatch_refusals: CounterVec,
    breaker_trips: CounterVec,
    proxies_burned: Counter,
    substrate_restarts: Counter,
    queue_depth: Gauge,
    running_jobs: Gauge,
    job_duration: HistogramVec,
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics").finish_non_exhaustive()
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl SchedulerMetrics {
    /// Create and register every metric in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_dispatched = CounterVec::new(
            opts("jobs_dispatched_total", "Jobs admitted for execution"),
            &["target_type"],
        )?;
        let job_outcomes = CounterVec::new(
            opts("job_outcomes_total", "Finished jobs by outcome"),
            &["target_type", "outcome"],
        )?;
        let error_kinds = CounterVec::new(
            opts("job_errors_total", "Classified job failures by kind"),
            &["kind"],
        )?;
        let dispatch_refusals = CounterVec::new(
            opts("dispatch_refusals_total", "Ready jobs held back by reason"),
            &["reason"],
        )?;
        let breaker_trips = CounterVec::new(
            opts("circuit_trips_total", "Circuit breaker openings by target"),
            &["target_type"],
        )?;
        let proxies_burned = Counter::with_opts(opts("proxies_burned_total", "Proxies burned after detection"))?;
        let substrate_restarts = Counter::with_opts(opts(
            "substrate_restarts_total",
            "Browser substrate restarts",
        ))?;
        let queue_depth = Gauge::with_opts(opts("queue_depth", "Jobs waiting in the queue"))?;
        let running_jobs = Gauge::with_opts(opts("running_jobs", "Jobs currently executing"))?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Operation run time in seconds")
                .namespace(NAMESPACE)
                .buckets(DURATION_BUCKETS.to_vec()),
            &["target_type"],
        )?;

        registry.register(Box::new(jobs_dispatched.clone()))?;
        registry.register(Box::new(job_outcomes.clone()))?;
        registry.register(Box::new(error_kinds.clone()))?;
        registry.register(Box::new(dispatch_refusals.clone()))?;
        registry.register(Box::new(breaker_trips.clone()))?;
        registry.register(Box::new(proxies_burned.clone()))?;
        registry.register(Box::new(substrate_restarts.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(running_jobs.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(Self {
            registry,
            jobs_dispatched,
            job_outcomes,
            error_kinds,
            dispatch_refusals,
            breaker_trips,
            proxies_burned,
            substrate_restarts,
            queue_depth,
            running_jobs,
            job_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ========================================================================
    // Recording
    // ========================================================================

    pub fn record_dispatch(&self, target_type: &str) {
        self.jobs_dispatched.with_label_values(&[target_type]).inc();
    }

    /// `outcome` is one of `success`, `retry` or `dropped`
    pub fn record_outcome(&self, target_type: &str, outcome: &str) {
        self.job_outcomes
            .with_label_values(&[target_type, outcome])
            .inc();
    }

    pub fn record_error_kind(&self, kind: ErrorKind) {
        self.error_kinds.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_refusal(&self, reason: &str) {
        self.dispatch_refusals.with_label_values(&[reason]).inc();
    }

    pub fn record_breaker_trip(&self, target_type: &str) {
        self.breaker_trips.with_label_values(&[target_type]).inc();
    }

    pub fn record_proxy_burned(&self) {
        self.proxies_burned.inc();
    }

    pub fn record_substrate_restart(&self) {
        self.substrate_restarts.inc();
    }

    pub fn observe_duration(&self, target_type: &str, secs: f64) {
        self.job_duration
            .with_label_values(&[target_type])
            .observe(secs);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_running(&self, running: usize) {
        self.running_jobs.set(running as f64);
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Encode all metrics to Prometheus text format
    pub fn render(&self) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = SchedulerMetrics::new().unwrap();
        let b = SchedulerMetrics::new().unwrap();
        a.record_dispatch("siteA");

        assert!(a.render().unwrap().contains("claimfleet_jobs_dispatched_total"));
        assert!(!b.render().unwrap().contains("siteA"));
    }

    #[test]
    fn test_render_includes_labels() {
        let metrics = SchedulerMetrics::new().unwrap();
        metrics.record_outcome("siteA", "success");
        metrics.record_error_kind(ErrorKind::RateLimited);
        metrics.record_refusal("rate_limited");
        metrics.record_breaker_trip("siteB");
        metrics.observe_duration("siteA", 12.5);
        metrics.set_queue_depth(7);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"outcome="success""#));
        assert!(text.contains(r#"kind="rate_limited""#));
        assert!(text.contains(r#"target_type="siteB""#));
        assert!(text.contains("claimfleet_job_duration_seconds_bucket"));
        assert!(text.contains("claimfleet_queue_depth 7"));
    }

    #[test]
    fn test_plain_counters() {
        let metrics = SchedulerMetrics::new().unwrap();
        metrics.record_proxy_burned();
        metrics.record_substrate_restart();
        metrics.record_substrate_restart();
        metrics.set_running(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("claimfleet_proxies_burned_total 1"));
        assert!(text.contains("claimfleet_substrate_restarts_total 2"));
        assert!(text.contains("claimfleet_running_jobs 2"));
    }
}
