//! Common test utilities

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use claimfleet::models::{AccountProfile, ExecutionError, Job, WorkResult};
use claimfleet::scheduler::{
    BrowserSubstrate, Operation, PageStatus, SessionOptions, SubstrateError, SubstrateResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fixed reference time
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// A job that is ready at [`t0`]
pub fn ready_job(name: &str, account: &str, target: &str, priority: i32) -> Job {
    Job::new(name, AccountProfile::new(account), target, "claim")
        .with_priority(priority)
        .with_next_run(t0() - Duration::seconds(1))
}

/// In-memory browser substrate that records what the scheduler asks of it
#[derive(Default)]
pub struct FakeSubstrate {
    next_id: AtomicU64,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub cookie_saves: AtomicUsize,
    pub restarts: AtomicUsize,
    pub fail_sessions: AtomicBool,
    pub unhealthy: AtomicBool,
    /// Panic once on the next page status check
    pub panic_on_status: AtomicBool,
    pub page_status: Mutex<PageStatus>,
    pub options_seen: Mutex<Vec<SessionOptions>>,
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_page_status(&self, status: PageStatus) {
        *self.page_status.lock().unwrap() = status;
    }

    pub fn proxies_used(&self) -> Vec<Option<String>> {
        self.options_seen
            .lock()
            .unwrap()
            .iter()
            .map(|o| o.proxy.clone())
            .collect()
    }
}

#[async_trait]
impl BrowserSubstrate for FakeSubstrate {
    type Session = u64;
    type Page = u64;

    async fn create_session(&self, options: &SessionOptions) -> SubstrateResult<u64> {
        self.options_seen.lock().unwrap().push(options.clone());
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(SubstrateError::SessionCreation("browser not responding".to_string()));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn new_page(&self, session: &u64) -> SubstrateResult<u64> {
        Ok(*session)
    }

    async fn check_page_status(&self, _page: &u64) -> PageStatus {
        if self.panic_on_status.swap(false, Ordering::SeqCst) {
            panic!("devtools connection dropped");
        }
        *self.page_status.lock().unwrap()
    }

    async fn check_health(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> SubstrateResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_cookies(&self, _session: &u64, _account_label: &str) -> SubstrateResult<()> {
        self.cookie_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _session: u64) -> SubstrateResult<()> {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted reaction of a [`ScriptedOperation`]
#[allow(dead_code)]
pub enum Step {
    Report(WorkResult),
    Fail(ExecutionError),
    Panic(&'static str),
}

/// Operation that plays back a script, then succeeds with a one hour delay
#[derive(Default)]
pub struct ScriptedOperation {
    steps: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedOperation {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_ok() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation<u64> for ScriptedOperation {
    async fn execute(&self, _job: &Job, _page: &u64) -> Result<WorkResult, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Report(result)) => Ok(result),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Panic(msg)) => panic!("{msg}"),
            None => Ok(WorkResult::success("claimed", 60.0)),
        }
    }
}
