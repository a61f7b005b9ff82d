use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tasker_cluster::error::{Result, TaskerError};
use tasker_cluster::scheduler::{ClusterScheduler, JobSpec, RemoteState};

/// Scriptable scheduler that records every call it receives
#[derive(Debug, Default)]
pub struct MockScheduler {
    jobs: Mutex<HashMap<String, RemoteState>>,
    submitted: Mutex<Vec<JobSpec>>,
    calls: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
    fail_queries: Mutex<bool>,
    fail_submit: Mutex<bool>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the state reported for `handle`
    pub fn set_state(&self, handle: &str, state: RemoteState) {
        self.jobs.lock().insert(handle.to_string(), state);
    }

    /// Make the job disappear, as when it finished
    pub fn finish(&self, handle: &str) {
        self.set_state(handle, RemoteState::NotFound);
    }

    pub fn fail_queries(&self, fail: bool) {
        *self.fail_queries.lock() = fail;
    }

    pub fn fail_submit(&self, fail: bool) {
        *self.fail_submit.lock() = fail;
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn transition(&self, handle: &str, state: RemoteState) -> Result<()> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(handle) {
            Some(current) => {
                *current = state;
                Ok(())
            }
            None => Err(TaskerError::SchedulerError(format!("unknown job {handle}"))),
        }
    }
}

#[async_trait]
impl ClusterScheduler for MockScheduler {
    fn name(&self) -> &str {
        "mock"
    }

    async fn submit(&self, job: &JobSpec) -> Result<String> {
        self.record(format!("submit {}", job.name));
        if *self.fail_submit.lock() {
            return Err(TaskerError::SchedulerError("submission refused".to_string()));
        }
        let handle = {
            let mut next = self.next_id.lock();
            *next += 1;
            format!("mock-{}", *next)
        };
        self.jobs.lock().insert(handle.clone(), RemoteState::Queued);
        self.submitted.lock().push(job.clone());
        Ok(handle)
    }

    async fn query_status(&self, job_handle: &str, _last_known_update: DateTime<Utc>) -> Result<RemoteState> {
        self.record(format!("query {job_handle}"));
        if *self.fail_queries.lock() {
            return Err(TaskerError::SchedulerError("scheduler unreachable".to_string()));
        }
        Ok(self
            .jobs
            .lock()
            .get(job_handle)
            .copied()
            .unwrap_or(RemoteState::NotFound))
    }

    async fn terminate(&self, job_handle: &str) -> Result<()> {
        self.record(format!("terminate {job_handle}"));
        self.transition(job_handle, RemoteState::NotFound)
    }

    async fn suspend(&self, job_handle: &str) -> Result<()> {
        self.record(format!("suspend {job_handle}"));
        self.transition(job_handle, RemoteState::Suspended)
    }

    async fn resume(&self, job_handle: &str) -> Result<()> {
        self.record(format!("resume {job_handle}"));
        self.transition(job_handle, RemoteState::Running)
    }

    async fn hold(&self, job_handle: &str) -> Result<()> {
        self.record(format!("hold {job_handle}"));
        self.transition(job_handle, RemoteState::Held)
    }

    async fn release(&self, job_handle: &str) -> Result<()> {
        self.record(format!("release {job_handle}"));
        self.transition(job_handle, RemoteState::Queued)
    }
}
