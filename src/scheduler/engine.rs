//! Scheduling loop
//!
//! One task owns every piece of scheduler state: the queue, the breaker, the
//! proxy rotator and the rate limiter. Each admitted job runs on its own task
//! inside a [`JoinSet`] and only touches its own browser session; the job
//! comes back to the loop as a [`JobOutcome`] and the loop applies the
//! consequences. No lock guards scheduler state because nothing else can
//! reach it.
//!
//! ```text
//!  enqueue ──► JobQueue ──► admit_ready ──► JoinSet (run_job per job)
//!                 ▲                                   │
//!                 └──── apply_outcome ◄── JobOutcome ─┘
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use super::error::{SchedulerError, SchedulerResult};
use super::health::{HealthCheckOutcome, HealthMonitor, HealthStats};
use super::queue::JobQueue;
use super::registry::{Operation, WorkerRegistry};
use super::substrate::{
    BrowserSubstrate, GeolocationProvider, NeverSuspend, PageStatus, SessionOptions, SubstrateError,
    SuspendPolicy,
};
use crate::config::Config;
use crate::metrics::SchedulerMetrics;
use crate::models::{ErrorKind, ExecutionError, Job, WorkResult};
use crate::proxy::ProxyRotator;
use crate::resilience::{
    CircuitBreaker, DomainRateLimiter, ErrorClassifier, FailureSignal, RecoveryDelay, RecoveryEffect,
    RecoveryPolicy,
};
use crate::storage::{HeartbeatWriter, SessionStore};
use crate::utils::{format_secs, truncate_text};

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for the scheduling loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs running at once across all accounts
    pub max_concurrent: usize,

    /// Jobs running at once per account, unless the account overrides it
    pub max_per_account: usize,

    /// Longest sleep between ticks while jobs are queued (seconds)
    pub tick_ceiling_secs: u64,

    /// Sleep between ticks while the queue is empty (seconds)
    pub idle_sleep_secs: u64,

    pub heartbeat_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub health_interval_secs: u64,

    /// Minimum gap between two accesses to one target (seconds)
    pub min_gap_secs: i64,

    /// Retry delay for a job whose account is at its concurrency limit
    pub account_busy_backoff_secs: i64,

    /// Retry delay for a job whose account is suspended
    pub suspend_backoff_secs: i64,

    /// Consecutive execution exceptions that trigger a substrate restart
    pub substrate_failure_threshold: u32,

    /// How long a stop waits for running jobs to report back (seconds)
    pub shutdown_grace_secs: u64,

    /// Floor for the worker-suggested delay after a success (seconds)
    pub min_success_delay_secs: i64,

    /// Ceiling for the worker-suggested delay after a success (seconds)
    pub max_success_delay_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_per_account: 1,
            tick_ceiling_secs: 10,
            idle_sleep_secs: 30,
            heartbeat_interval_secs: 60,
            checkpoint_interval_secs: 300,
            health_interval_secs: 600,
            min_gap_secs: 45,
            account_busy_backoff_secs: 30,
            suspend_backoff_secs: 3600,
            substrate_failure_threshold: 5,
            shutdown_grace_secs: 60,
            min_success_delay_secs: 60,
            max_success_delay_secs: 7 * 24 * 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_concurrent == 0 {
            return Err(SchedulerError::invalid_config("max_concurrent", "must be at least 1"));
        }
        if self.max_per_account == 0 {
            return Err(SchedulerError::invalid_config("max_per_account", "must be at least 1"));
        }
        if self.tick_ceiling_secs == 0 {
            return Err(SchedulerError::invalid_config("tick_ceiling_secs", "must be at least 1"));
        }
        if self.substrate_failure_threshold == 0 {
            return Err(SchedulerError::invalid_config(
                "substrate_failure_threshold",
                "must be at least 1",
            ));
        }
        if self.min_gap_secs < 0 || self.account_busy_backoff_secs < 0 || self.suspend_backoff_secs < 0 {
            return Err(SchedulerError::invalid_config("backoff", "delays cannot be negative"));
        }
        if self.max_success_delay_secs < self.min_success_delay_secs {
            return Err(SchedulerError::invalid_config(
                "max_success_delay_secs",
                "must not be below min_success_delay_secs",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Job Execution
// ============================================================================

/// Why an execution produced no [`WorkResult`]
#[derive(Debug, Clone)]
pub enum RunError {
    /// The operation returned an error
    Execution(ExecutionError),
    /// The substrate failed to provide a session or page
    Substrate(SubstrateError),
    /// The operation panicked
    Panicked(String),
    /// The substrate panicked while opening, checking or closing the session
    SubstratePanicked(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution(e) => write!(f, "{e}"),
            Self::Substrate(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "operation panicked: {msg}"),
            Self::SubstratePanicked(msg) => write!(f, "substrate panicked: {msg}"),
        }
    }
}

/// What a finished job task reports back to the loop
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub proxy: Option<String>,
    pub result: Result<WorkResult, RunError>,
    pub page_status: Option<PageStatus>,
    /// Time spent inside the operation, if it ran
    pub duration: Option<Duration>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one job in a fresh session. The session is always closed.
async fn run_job<S: BrowserSubstrate>(
    substrate: &S,
    geolocation: Option<&dyn GeolocationProvider>,
    operation: &dyn Operation<S::Page>,
    job: &Job,
    proxy: Option<String>,
) -> (Result<WorkResult, RunError>, Option<PageStatus>, Option<Duration>) {
    let hint = match (geolocation, proxy.as_deref()) {
        (Some(geo), Some(p)) => geo.geolocation_for_proxy(p).await,
        _ => None,
    };
    let options = SessionOptions::new(job.account.label.clone())
        .with_proxy(proxy)
        .with_geo(hint);

    let session = match substrate.create_session(&options).await {
        Ok(session) => session,
        Err(e) => return (Err(RunError::Substrate(e)), None, None),
    };

    let (result, page_status, duration) = match substrate.new_page(&session).await {
        Ok(page) => {
            let started = Instant::now();
            let result = match AssertUnwindSafe(operation.execute(job, &page))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(RunError::Execution(e)),
                Err(payload) => Err(RunError::Panicked(panic_message(payload.as_ref()))),
            };
            let duration = started.elapsed();
            let status = substrate.check_page_status(&page).await;
            (result, Some(status), Some(duration))
        }
        Err(e) => (Err(RunError::Substrate(e)), None, None),
    };

    if matches!(&result, Ok(r) if r.success) {
        if let Err(e) = substrate.save_cookies(&session, &job.account.label).await {
            tracing::warn!(account = %job.account.label, error = %e, "Failed to save cookies");
        }
    }

    if let Err(e) = substrate.close(session).await {
        tracing::warn!(account = %job.account.label, error = %e, "Failed to close session");
    }

    (result, page_status, duration)
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Enqueue(Job),
    Status(oneshot::Sender<SchedulerStatus>),
    Stop,
}

/// Cloneable handle for talking to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl SchedulerHandle {
    pub fn enqueue(&self, job: Job) -> SchedulerResult<()> {
        self.commands
            .send(Command::Enqueue(job))
            .map_err(|_| SchedulerError::ChannelClosed)
    }

    /// Ask the loop to drain running jobs, persist and return
    pub fn stop(&self) -> SchedulerResult<()> {
        self.commands
            .send(Command::Stop)
            .map_err(|_| SchedulerError::ChannelClosed)
    }

    pub async fn status(&self) -> SchedulerResult<SchedulerStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| SchedulerError::ChannelClosed)?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)
    }
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub running: usize,
    pub next_wake: Option<DateTime<Utc>>,
    pub open_circuits: Vec<(String, DateTime<Utc>)>,
    pub burned_proxies: Vec<String>,
    pub consecutive_failures: u32,
    pub health: HealthStats,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler<S: BrowserSubstrate> {
    config: SchedulerConfig,
    substrate: Arc<S>,
    registry: WorkerRegistry<S::Page>,
    geolocation: Option<Arc<dyn GeolocationProvider>>,
    suspend_policy: Arc<dyn SuspendPolicy>,
    metrics: Option<Arc<SchedulerMetrics>>,

    queue: JobQueue,
    running: HashMap<Uuid, Job>,
    account_running: HashMap<String, usize>,
    tasks: JoinSet<JobOutcome>,

    rate_limiter: DomainRateLimiter,
    breaker: CircuitBreaker,
    recovery: RecoveryPolicy,
    classifier: ErrorClassifier,
    proxies: ProxyRotator,
    rng: ChaCha8Rng,
    consecutive_failures: u32,

    store: Option<SessionStore>,
    heartbeat: Option<HeartbeatWriter>,
    health: HealthMonitor,
    last_heartbeat: Option<Instant>,
    last_checkpoint: Instant,

    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Option<mpsc::UnboundedReceiver<Command>>,
}

impl<S: BrowserSubstrate> Scheduler<S> {
    pub fn new(config: SchedulerConfig, substrate: Arc<S>, registry: WorkerRegistry<S::Page>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            rate_limiter: DomainRateLimiter::new(ChronoDuration::seconds(config.min_gap_secs)),
            health: HealthMonitor::new(Duration::from_secs(config.health_interval_secs)),
            config,
            substrate,
            registry,
            geolocation: None,
            suspend_policy: Arc::new(NeverSuspend),
            metrics: None,
            queue: JobQueue::new(),
            running: HashMap::new(),
            account_running: HashMap::new(),
            tasks: JoinSet::new(),
            breaker: CircuitBreaker::with_defaults(),
            recovery: RecoveryPolicy::default(),
            classifier: ErrorClassifier::new(),
            proxies: ProxyRotator::default(),
            rng: ChaCha8Rng::from_entropy(),
            consecutive_failures: 0,
            store: None,
            heartbeat: None,
            last_heartbeat: None,
            last_checkpoint: Instant::now(),
            commands_tx,
            commands_rx: Some(commands_rx),
        }
    }

    /// Validate `config` and build a scheduler with every component taken from it
    pub fn from_config(
        config: &Config,
        substrate: Arc<S>,
        registry: WorkerRegistry<S::Page>,
    ) -> crate::error::Result<Self> {
        config.scheduler.validate()?;
        config
            .validate()
            .map_err(|e| crate::error::Error::config(format!("{e:#}")))?;

        Ok(Self::new(config.scheduler.clone(), substrate, registry)
            .with_breaker(CircuitBreaker::new(config.breaker.clone()))
            .with_recovery(RecoveryPolicy::new(config.recovery.clone()))
            .with_proxy_rotator(ProxyRotator::new(config.proxy.clone()))
            .with_session_store(config.storage.session_store())
            .with_heartbeat(config.storage.heartbeat_writer()))
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_proxy_rotator(mut self, proxies: ProxyRotator) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatWriter) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_geolocation(mut self, provider: Arc<dyn GeolocationProvider>) -> Self {
        self.geolocation = Some(provider);
        self
    }

    pub fn with_suspend_policy(mut self, policy: Arc<dyn SuspendPolicy>) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fix the jitter RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Queue a job unless one with the same name is queued or running
    pub fn enqueue(&mut self, job: Job) -> SchedulerResult<()> {
        if self.running.values().any(|j| j.name == job.name) {
            return Err(SchedulerError::duplicate_job(job.name));
        }
        let name = job.name.clone();
        if !self.queue.push(job) {
            return Err(SchedulerError::duplicate_job(name));
        }
        tracing::debug!(job = %name, queued = self.queue.len(), "Job enqueued");
        Ok(())
    }

    pub fn queued_jobs(&self) -> Vec<Job> {
        self.queue.snapshot()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn proxies(&self) -> &ProxyRotator {
        &self.proxies
    }

    pub fn rate_limiter(&self) -> &DomainRateLimiter {
        &self.rate_limiter
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        SchedulerStatus {
            queued: self.queue.len(),
            running: self.running.len(),
            next_wake: self.queue.next_wake(),
            open_circuits: self.breaker.open_targets(now),
            burned_proxies: self.proxies.burned_proxies(now),
            consecutive_failures: self.consecutive_failures,
            health: self.health.stats(),
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load the last session into the queue and rate limiter
    pub fn restore(&mut self) -> SchedulerResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let session = store
            .restore()
            .map_err(|e| SchedulerError::persistence("restore session", &e))?;
        let Some(session) = session else {
            tracing::info!("No previous session, starting empty");
            return Ok(0);
        };

        self.rate_limiter.import(&session.domain_last_access);
        let mut restored = 0;
        for job in session.jobs {
            match self.enqueue(job) {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!(error = %e, "Skipping restored job"),
            }
        }
        Ok(restored)
    }

    /// Save queued and running jobs with the rate limiter state.
    ///
    /// Running jobs are saved as they were admitted so a crash re-runs them.
    pub fn persist(&self) -> SchedulerResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut jobs = self.queue.snapshot();
        jobs.extend(self.running.values().cloned());
        store
            .persist(&jobs, self.rate_limiter.export())
            .map_err(|e| SchedulerError::persistence("save session", &e))?;
        Ok(())
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// Run until a stop command arrives, then drain, persist and return
    pub async fn run(&mut self) -> SchedulerResult<()> {
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| SchedulerError::invalid_config("run", "scheduler loop already running"))?;

        tracing::info!(
            queued = self.queue.len(),
            max_concurrent = self.config.max_concurrent,
            "Scheduler started"
        );

        loop {
            self.tick_at(Utc::now()).await;
            let sleep_for = self.sleep_duration(Utc::now());

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined, Utc::now()).await;
                }
                command = commands.recv() => match command {
                    Some(Command::Enqueue(job)) => {
                        if let Err(e) = self.enqueue(job) {
                            tracing::debug!(error = %e, "Enqueue ignored");
                        }
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Stop) | None => break,
                },
            }
        }

        self.shutdown().await;
        self.commands_rx = Some(commands);
        Ok(())
    }

    /// One scheduling pass: maintenance, admission, dispatch.
    ///
    /// Returns the number of jobs started.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> usize {
        self.run_maintenance().await;

        let admitted = self.admit_ready(now);
        let started = admitted.len();
        for (job, operation) in admitted {
            self.spawn_job(job, operation, now);
        }

        self.update_gauges();
        started
    }

    /// Wait for running jobs and apply their outcomes at `now`.
    ///
    /// Gives up after `grace`; jobs still running keep running.
    pub async fn drain_at(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut finished = 0;

        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => {
                    self.handle_joined(joined, now).await;
                    finished += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(still_running = self.tasks.len(), "Drain grace period elapsed");
                    break;
                }
            }
        }

        self.update_gauges();
        finished
    }

    async fn shutdown(&mut self) {
        tracing::info!(running = self.running.len(), "Stop requested, draining running jobs");

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(joined)) => self.handle_joined(joined, Utc::now()).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !self.tasks.is_empty() {
            tracing::warn!(
                stragglers = self.tasks.len(),
                "Jobs still running after grace period, detaching"
            );
            self.tasks.detach_all();
        }

        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "Final session save failed");
        }
        self.write_heartbeat();

        tracing::info!(queued = self.queue.len(), "Scheduler stopped");
    }

    fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        let ceiling = Duration::from_secs(self.config.tick_ceiling_secs);
        match self.queue.next_wake() {
            None => Duration::from_secs(self.config.idle_sleep_secs),
            Some(wake) => {
                let wait = (wake - now).num_milliseconds();
                if wait <= 0 {
                    // Only jobs held back by the global limit are overdue;
                    // a finishing job wakes the loop through the join set.
                    ceiling
                } else {
                    Duration::from_millis(wait as u64).min(ceiling)
                }
            }
        }
    }

    async fn run_maintenance(&mut self) {
        let now = Instant::now();

        let heartbeat_due = self.last_heartbeat.map_or(true, |last| {
            now.duration_since(last) >= Duration::from_secs(self.config.heartbeat_interval_secs)
        });
        if heartbeat_due {
            self.write_heartbeat();
            self.last_heartbeat = Some(now);
        }

        if now.duration_since(self.last_checkpoint) >= Duration::from_secs(self.config.checkpoint_interval_secs) {
            if let Err(e) = self.persist() {
                tracing::warn!(error = %e, "Periodic session save failed");
            }
            self.last_checkpoint = now;
        }

        if self.health.is_due(now) {
            if let HealthCheckOutcome::Restarted = self.health.check(&*self.substrate).await {
                if let Some(m) = &self.metrics {
                    m.record_substrate_restart();
                }
            }
        }
    }

    fn write_heartbeat(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            if let Err(e) = heartbeat.write(self.queue.len(), self.running.len()) {
                tracing::warn!(error = %e, "Heartbeat write failed");
            }
        }
    }

    fn update_gauges(&self) {
        if let Some(m) = &self.metrics {
            m.set_queue_depth(self.queue.len());
            m.set_running(self.running.len());
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Take ready jobs in scheduling order and decide which may start now
    fn admit_ready(&mut self, now: DateTime<Utc>) -> Vec<(Job, Arc<dyn Operation<S::Page>>)> {
        let mut ready = self.queue.drain_ready(now).into_iter();
        let mut admitted = Vec::new();

        while let Some(mut job) = ready.next() {
            if self.running.len() >= self.config.max_concurrent {
                self.queue.requeue(job);
                for rest in ready.by_ref() {
                    self.queue.requeue(rest);
                }
                break;
            }

            let operation = match self.registry.resolve(&job.target_type, &job.operation) {
                Ok(operation) => operation,
                Err(e) => {
                    tracing::error!(
                        job = %job.name,
                        account = %job.account.label,
                        target_type = %job.target_type,
                        error = %e,
                        "No worker for job, dropping"
                    );
                    if let Some(m) = &self.metrics {
                        m.record_outcome(&job.target_type, "dropped");
                    }
                    continue;
                }
            };

            if let Some((reason, until)) = self.refusal(&job, now) {
                tracing::debug!(
                    job = %job.name,
                    account = %job.account.label,
                    target_type = %job.target_type,
                    reason = reason,
                    retry_in = %format_secs((until - now).num_seconds()),
                    "Dispatch deferred"
                );
                if let Some(m) = &self.metrics {
                    m.record_refusal(reason);
                }
                job.next_run = until;
                self.queue.requeue(job);
                continue;
            }

            self.rate_limiter.record_access_at(&job.target_type, now);
            *self.account_running.entry(job.account.label.clone()).or_insert(0) += 1;
            self.running.insert(job.id, job.clone());
            if let Some(m) = &self.metrics {
                m.record_dispatch(&job.target_type);
            }

            tracing::info!(
                job = %job.name,
                account = %job.account.label,
                target_type = %job.target_type,
                operation = %job.operation,
                retry_count = job.retry_count,
                "Job dispatched"
            );
            admitted.push((job, operation));
        }

        admitted
    }

    /// Reason and new run time if `job` may not start at `now`
    fn refusal(&mut self, job: &Job, now: DateTime<Utc>) -> Option<(&'static str, DateTime<Utc>)> {
        let limit = job.account.max_concurrent.unwrap_or(self.config.max_per_account);
        let busy = self.account_running.get(&job.account.label).copied().unwrap_or(0);
        if busy >= limit {
            return Some((
                "account_busy",
                now + ChronoDuration::seconds(self.config.account_busy_backoff_secs),
            ));
        }

        if self.breaker.is_open_at(&job.target_type, now) {
            let until = self
                .breaker
                .cooldown_until(&job.target_type)
                .unwrap_or(now + ChronoDuration::seconds(self.config.account_busy_backoff_secs));
            return Some(("circuit_open", until));
        }

        let wait = self.rate_limiter.get_delay_at(&job.target_type, now);
        if wait > ChronoDuration::zero() {
            return Some(("rate_limited", now + wait));
        }

        if self.suspend_policy.should_suspend(&job.account, &job.target_type) {
            return Some((
                "suspended",
                now + ChronoDuration::seconds(self.config.suspend_backoff_secs),
            ));
        }

        None
    }

    fn spawn_job(&mut self, job: Job, operation: Arc<dyn Operation<S::Page>>, now: DateTime<Utc>) {
        let proxy = self.proxies.next_proxy_at(&job.account, now);
        let substrate = Arc::clone(&self.substrate);
        let geolocation = self.geolocation.clone();

        self.tasks.spawn(async move {
            // A panic anywhere in the substrate must still report back, or the
            // slot, the account counter and the job itself are lost
            let run = run_job(
                &*substrate,
                geolocation.as_deref(),
                &*operation,
                &job,
                proxy.clone(),
            );
            let (result, page_status, duration) = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(reported) => reported,
                Err(payload) => (
                    Err(RunError::SubstratePanicked(panic_message(payload.as_ref()))),
                    None,
                    None,
                ),
            };

            JobOutcome {
                job,
                proxy,
                result,
                page_status,
                duration,
            }
        });
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    async fn handle_joined(&mut self, joined: Result<JobOutcome, JoinError>, now: DateTime<Utc>) {
        match joined {
            Ok(outcome) => self.apply_outcome(outcome, now).await,
            Err(e) => {
                // Every panic is caught inside the task, so only a cancelled
                // task lands here
                tracing::error!(error = %e, "Job task ended without reporting");
            }
        }
    }

    /// Apply everything a finished job implies for scheduler state
    pub async fn apply_outcome(&mut self, outcome: JobOutcome, now: DateTime<Utc>) {
        let JobOutcome {
            mut job,
            proxy,
            result,
            page_status,
            duration,
        } = outcome;

        self.release(&job);

        if let (Some(m), Some(d)) = (&self.metrics, duration) {
            m.observe_duration(&job.target_type, d.as_secs_f64());
        }

        if let (Some(proxy), Some(status)) = (proxy.as_deref(), page_status) {
            let succeeded = matches!(&result, Ok(r) if r.success);
            self.record_proxy_signal(proxy, status, succeeded, now);
        }

        match result {
            Ok(result) if result.success => {
                self.consecutive_failures = 0;
                self.on_success(job, result, now);
            }
            Ok(result) => {
                self.consecutive_failures = 0;
                let kind = result
                    .error_kind
                    .unwrap_or_else(|| self.classifier.classify_status_text(&result.status));
                tracing::info!(
                    job = %job.name,
                    account = %job.account.label,
                    target_type = %job.target_type,
                    kind = %kind,
                    status = %truncate_text(&result.status, 120),
                    "Job failed"
                );
                self.recover(&mut job, kind, proxy.as_deref(), now);
            }
            Err(error) => {
                let kind = self.classify_run_error(&error);
                tracing::warn!(
                    job = %job.name,
                    account = %job.account.label,
                    target_type = %job.target_type,
                    kind = %kind,
                    error = %truncate_text(&error.to_string(), 200),
                    "Job raised an error"
                );
                self.recover(&mut job, kind, proxy.as_deref(), now);
                self.note_execution_failure().await;
            }
        }
    }

    fn release(&mut self, job: &Job) {
        self.running.remove(&job.id);
        if let Some(count) = self.account_running.get_mut(&job.account.label) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.account_running.remove(&job.account.label);
            }
        }
    }

    fn record_proxy_signal(&mut self, proxy: &str, status: PageStatus, succeeded: bool, now: DateTime<Utc>) {
        if status.blocked {
            if !self.proxies.is_burned(proxy) {
                self.proxies.record_failure_at(proxy, true, now);
                if let Some(m) = &self.metrics {
                    m.record_proxy_burned();
                }
            }
        } else if status.network_error {
            self.proxies.record_failure_at(proxy, false, now);
        } else if succeeded {
            self.proxies.record_success(proxy);
        }
    }

    fn classify_run_error(&self, error: &RunError) -> ErrorKind {
        match error {
            RunError::Execution(e) => self.classifier.classify_execution_error(e),
            RunError::Substrate(e) => {
                let message = e.to_string();
                self.classifier.classify(&FailureSignal::from_message(&message))
            }
            RunError::Panicked(msg) | RunError::SubstratePanicked(msg) => {
                self.classifier.classify(&FailureSignal::from_message(msg))
            }
        }
    }

    /// Worker-suggested delay in seconds, kept between the configured floor
    /// and ceiling. NaN and negative suggestions fall to the floor.
    fn success_delay_secs(&self, next_delay_minutes: f64) -> i64 {
        let floor = self.config.min_success_delay_secs;
        let ceiling = self.config.max_success_delay_secs.max(floor);
        let suggested = next_delay_minutes * 60.0;
        if suggested.is_nan() {
            return floor;
        }
        (suggested.clamp(0.0, ceiling as f64).round() as i64).clamp(floor, ceiling)
    }

    fn on_success(&mut self, mut job: Job, result: WorkResult, now: DateTime<Utc>) {
        let delay = ChronoDuration::seconds(self.success_delay_secs(result.next_delay_minutes));

        self.breaker.record_success(&job.target_type);
        job.retry_count = 0;
        job.reschedule(now, delay);

        tracing::info!(
            job = %job.name,
            account = %job.account.label,
            target_type = %job.target_type,
            status = %truncate_text(&result.status, 120),
            next_in = %format_secs(delay.num_seconds()),
            "Job succeeded"
        );
        if let Some(m) = &self.metrics {
            m.record_outcome(&job.target_type, "success");
        }
        self.queue.requeue(job);
    }

    /// Feed a classified failure through breaker and recovery policy, then
    /// re-enqueue or drop the job
    fn recover(&mut self, job: &mut Job, kind: ErrorKind, proxy: Option<&str>, now: DateTime<Utc>) {
        if let Some(m) = &self.metrics {
            m.record_error_kind(kind);
        }

        let breaker_outcome = self.breaker.record_failure_at(&job.target_type, kind, now);
        if breaker_outcome.opened {
            if let Some(m) = &self.metrics {
                m.record_breaker_trip(&job.target_type);
            }
        }

        let plan = self
            .recovery
            .plan(kind, job.retry_count, job.is_privileged(), &mut self.rng);

        match plan.effect {
            Some(RecoveryEffect::BurnProxy) => {
                if let Some(proxy) = proxy {
                    if !self.proxies.is_burned(proxy) {
                        self.proxies.record_failure_at(proxy, true, now);
                        if let Some(m) = &self.metrics {
                            m.record_proxy_burned();
                        }
                    }
                }
            }
            Some(RecoveryEffect::SuspendTarget(duration)) => {
                let trips_before = self.breaker.history().len();
                self.breaker.force_open(&job.target_type, kind, duration, now);
                if self.breaker.history().len() > trips_before {
                    if let Some(m) = &self.metrics {
                        m.record_breaker_trip(&job.target_type);
                    }
                }
            }
            None => {}
        }

        let delay = match plan.delay {
            RecoveryDelay::Never => {
                self.drop_job(job, kind, plan.action);
                return;
            }
            RecoveryDelay::RetryAfter(delay) => delay,
        };

        job.retry_count += 1;
        if self.recovery.budget_exhausted(job.retry_count) {
            self.drop_job(job, kind, "retry budget exhausted");
            return;
        }

        job.reschedule(now, delay);
        tracing::info!(
            job = %job.name,
            account = %job.account.label,
            target_type = %job.target_type,
            kind = %kind,
            action = plan.action,
            retry_count = job.retry_count,
            delay_secs = delay.num_seconds(),
            "Job rescheduled"
        );
        if let Some(m) = &self.metrics {
            m.record_outcome(&job.target_type, "retry");
        }
        self.queue.requeue(job.clone());
    }

    fn drop_job(&self, job: &Job, kind: ErrorKind, reason: &str) {
        tracing::warn!(
            job = %job.name,
            account = %job.account.label,
            target_type = %job.target_type,
            kind = %kind,
            retry_count = job.retry_count,
            reason = reason,
            "Job dropped"
        );
        if let Some(m) = &self.metrics {
            m.record_outcome(&job.target_type, "dropped");
        }
    }

    async fn note_execution_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.config.substrate_failure_threshold {
            return;
        }

        tracing::warn!(
            failures = self.consecutive_failures,
            "Consecutive execution failures reached threshold, restarting substrate"
        );
        self.consecutive_failures = 0;
        if self
            .health
            .restart(&*self.substrate, "consecutive execution failures")
            .await
            .is_ok()
        {
            if let Some(m) = &self.metrics {
                m.record_substrate_restart();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountProfile;
    use crate::scheduler::substrate::SubstrateResult;
    use async_trait::async_trait;

    struct Inert;

    #[async_trait]
    impl BrowserSubstrate for Inert {
        type Session = ();
        type Page = ();

        async fn create_session(&self, _options: &SessionOptions) -> SubstrateResult<()> {
            Ok(())
        }
        async fn new_page(&self, _session: &()) -> SubstrateResult<()> {
            Ok(())
        }
        async fn check_page_status(&self, _page: &()) -> PageStatus {
            PageStatus::default()
        }
        async fn check_health(&self) -> bool {
            true
        }
        async fn restart(&self) -> SubstrateResult<()> {
            Ok(())
        }
        async fn save_cookies(&self, _session: &(), _label: &str) -> SubstrateResult<()> {
            Ok(())
        }
        async fn close(&self, _session: ()) -> SubstrateResult<()> {
            Ok(())
        }
    }

    struct Claim;

    #[async_trait]
    impl Operation<()> for Claim {
        async fn execute(&self, _job: &Job, _page: &()) -> Result<WorkResult, ExecutionError> {
            Ok(WorkResult::success("ok", 60.0))
        }
    }

    struct SuspendAll;

    impl SuspendPolicy for SuspendAll {
        fn should_suspend(&self, _account: &AccountProfile, _target_type: &str) -> bool {
            true
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn scheduler(config: SchedulerConfig) -> Scheduler<Inert> {
        let registry = WorkerRegistry::<()>::new()
            .with("siteA", "claim", Arc::new(Claim))
            .with("siteB", "claim", Arc::new(Claim))
            .with("siteC", "claim", Arc::new(Claim));
        Scheduler::new(config, Arc::new(Inert), registry).with_seed(7)
    }

    fn job(name: &str, account: &str, target: &str, priority: i32) -> Job {
        Job::new(name, AccountProfile::new(account), target, "claim")
            .with_priority(priority)
            .with_next_run(now() - ChronoDuration::seconds(1))
    }

    fn names(jobs: &[(Job, Arc<dyn Operation<()>>)]) -> Vec<String> {
        jobs.iter().map(|(j, _)| j.name.clone()).collect()
    }

    #[test]
    fn test_lower_priority_value_admitted_first() {
        let mut s = scheduler(SchedulerConfig {
            max_concurrent: 1,
            ..SchedulerConfig::default()
        });
        s.enqueue(job("b", "bob", "siteB", 2)).unwrap();
        s.enqueue(job("a", "alice", "siteA", 1)).unwrap();

        let admitted = s.admit_ready(now());
        assert_eq!(names(&admitted), vec!["a"]);

        // B waits for a free slot without being pushed back
        let queued = s.queued_jobs();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, "b");
        assert!(queued[0].next_run <= now());
    }

    #[test]
    fn test_account_limit_defers_by_backoff() {
        let mut s = scheduler(SchedulerConfig::default());
        s.enqueue(job("a1", "alice", "siteA", 0)).unwrap();
        s.enqueue(job("a2", "alice", "siteB", 1)).unwrap();

        let admitted = s.admit_ready(now());
        assert_eq!(names(&admitted), vec!["a1"]);

        let deferred = &s.queued_jobs()[0];
        assert_eq!(deferred.name, "a2");
        assert_eq!(deferred.next_run, now() + ChronoDuration::seconds(30));
    }

    #[test]
    fn test_account_override_allows_more() {
        let mut s = scheduler(SchedulerConfig::default());
        let mut account = AccountProfile::new("alice");
        account.max_concurrent = Some(2);
        let mut a1 = job("a1", "alice", "siteA", 0);
        let mut a2 = job("a2", "alice", "siteB", 1);
        a1.account = account.clone();
        a2.account = account;
        s.enqueue(a1).unwrap();
        s.enqueue(a2).unwrap();

        assert_eq!(s.admit_ready(now()).len(), 2);
    }

    #[test]
    fn test_rate_limit_defers_same_target() {
        let mut s = scheduler(SchedulerConfig::default());
        s.enqueue(job("a", "alice", "siteA", 0)).unwrap();
        s.enqueue(job("b", "bob", "siteA", 1)).unwrap();

        let admitted = s.admit_ready(now());
        assert_eq!(names(&admitted), vec!["a"]);
        assert_eq!(s.queued_jobs()[0].next_run, now() + ChronoDuration::seconds(45));
    }

    #[test]
    fn test_blocked_job_does_not_starve_others() {
        let mut s = scheduler(SchedulerConfig::default());
        s.breaker
            .force_open("siteA", ErrorKind::TargetDown, ChronoDuration::hours(4), now());
        s.enqueue(job("blocked", "alice", "siteA", 0)).unwrap();
        s.enqueue(job("free", "bob", "siteB", 5)).unwrap();

        let admitted = s.admit_ready(now());
        assert_eq!(names(&admitted), vec!["free"]);
        let blocked = &s.queued_jobs()[0];
        assert_eq!(blocked.next_run, now() + ChronoDuration::hours(4));
    }

    #[test]
    fn test_suspended_account_deferred() {
        let mut s = scheduler(SchedulerConfig::default()).with_suspend_policy(Arc::new(SuspendAll));
        s.enqueue(job("a", "alice", "siteA", 0)).unwrap();

        assert!(s.admit_ready(now()).is_empty());
        assert_eq!(s.queued_jobs()[0].next_run, now() + ChronoDuration::hours(1));
    }

    #[test]
    fn test_unknown_target_dropped() {
        let mut s = scheduler(SchedulerConfig::default());
        s.enqueue(job("ghost", "alice", "siteZ", 0)).unwrap();

        assert!(s.admit_ready(now()).is_empty());
        assert!(s.queued_jobs().is_empty());
        // No access recorded for a job that never ran
        assert_eq!(s.rate_limiter().get_delay_at("siteZ", now()), ChronoDuration::zero());
    }

    #[test]
    fn test_enqueue_rejects_running_name() {
        let mut s = scheduler(SchedulerConfig::default());
        s.enqueue(job("a", "alice", "siteA", 0)).unwrap();
        assert_eq!(s.admit_ready(now()).len(), 1);

        assert!(matches!(
            s.enqueue(job("a", "alice", "siteA", 0)),
            Err(SchedulerError::DuplicateJob { .. })
        ));
        assert!(s.enqueue(job("b", "bob", "siteB", 0)).is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let bad = SchedulerConfig {
            max_concurrent: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(SchedulerError::InvalidConfig { .. })));
    }

    #[test]
    fn test_from_config_rejects_invalid_sections() {
        let registry = WorkerRegistry::<()>::new().with("siteA", "claim", Arc::new(Claim));
        let mut config = Config::default();
        config.scheduler.max_concurrent = 0;
        let err = Scheduler::from_config(&config, Arc::new(Inert), registry)
            .err()
            .expect("zero concurrency is rejected");
        assert!(matches!(
            err,
            crate::error::Error::Scheduler(SchedulerError::InvalidConfig { .. })
        ));
        assert_eq!(err.category(), crate::error::ErrorCategory::Config);

        let registry = WorkerRegistry::<()>::new().with("siteA", "claim", Arc::new(Claim));
        let mut config = Config::default();
        config.proxy.max_failures = 0;
        let err = Scheduler::from_config(&config, Arc::new(Inert), registry)
            .err()
            .expect("zero proxy failures is rejected");
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn test_success_delay_clamped() {
        let s = scheduler(SchedulerConfig::default());
        assert_eq!(s.success_delay_secs(30.0), 1800);
        assert_eq!(s.success_delay_secs(0.0), 60);
        assert_eq!(s.success_delay_secs(-5.0), 60);
        assert_eq!(s.success_delay_secs(f64::NAN), 60);
        assert_eq!(s.success_delay_secs(f64::INFINITY), 604_800);
        assert_eq!(s.success_delay_secs(1e18), 604_800);

        let bad = SchedulerConfig {
            max_success_delay_secs: 10,
            ..SchedulerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_sleep_duration_bounds() {
        let mut s = scheduler(SchedulerConfig::default());
        assert_eq!(s.sleep_duration(now()), Duration::from_secs(30));

        s.enqueue(job("late", "bob", "siteB", 0).with_next_run(now() + ChronoDuration::hours(1)))
            .unwrap();
        assert_eq!(s.sleep_duration(now()), Duration::from_secs(10));

        s.enqueue(job("soon", "alice", "siteA", 0).with_next_run(now() + ChronoDuration::seconds(3)))
            .unwrap();
        assert_eq!(s.sleep_duration(now()), Duration::from_secs(3));
    }
}
