use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

use crate::domain::provider::backend::nrm_backend_trait::BackendOperation;
use crate::domain::provider::health::health_monitor::HealthReport;
use crate::domain::provider::scheduler::retry_policy::RetryPolicy;
use crate::domain::provider::topology::topology_cache::TopologySnapshot;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId, JobId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    BackendCall(BackendOperation),
    HealthCheck,
    TopologyRefresh { force: bool },
    /// With a target: expire that reservation if its deadline passed. Without: sweep all.
    TimeoutSweep,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::BackendCall(op) => write!(f, "backend-{:?}", op),
            JobKind::HealthCheck => write!(f, "health-check"),
            JobKind::TopologyRefresh { .. } => write!(f, "topology-refresh"),
            JobKind::TimeoutSweep => write!(f, "timeout-sweep"),
        }
    }
}

/// Ordering key. Jobs sharing a key run one at a time in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Reservation(ConnectionId),
    Global(&'static str),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub target: Option<ConnectionId>,
    /// Reservation version at the time the job was issued, used to drop stale confirmations.
    pub issued_at_version: Option<u64>,
    /// Number of executions started so far, 1 during the first execution.
    pub attempt: u32,
    /// Absolute time (ms). A job still waiting when it passes is failed without running.
    pub deadline: Option<i64>,
    /// Upper bound for a single execution.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Re-run interval for periodic jobs.
    pub repeat: Option<Duration>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        match &self.target {
            Some(id) => JobKey::Reservation(id.clone()),
            None => JobKey::Global(match self.kind {
                JobKind::BackendCall(_) => "backend-call",
                JobKind::HealthCheck => "health-check",
                JobKind::TopologyRefresh { .. } => "topology-refresh",
                JobKind::TimeoutSweep => "timeout-sweep",
            }),
        }
    }
}

/// Everything needed to submit a job; the scheduler assigns the id.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub target: Option<ConnectionId>,
    pub issued_at_version: Option<u64>,
    pub run_at: Option<i64>,
    pub deadline: Option<i64>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub repeat: Option<Duration>,
}

impl JobRequest {
    pub fn new(kind: JobKind) -> Self {
        JobRequest {
            kind,
            target: None,
            issued_at_version: None,
            run_at: None,
            deadline: None,
            timeout: None,
            retry: RetryPolicy::no_retry(),
            repeat: None,
        }
    }

    pub fn for_reservation(mut self, id: ConnectionId, version: u64) -> Self {
        self.target = Some(id);
        self.issued_at_version = Some(version);
        self
    }

    /// Delays the first execution until `time_ms`.
    pub fn run_at(mut self, time_ms: i64) -> Self {
        self.run_at = Some(time_ms);
        self
    }

    pub fn with_deadline(mut self, time_ms: i64) -> Self {
        self.deadline = Some(time_ms);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.repeat = Some(interval);
        self
    }

    pub(crate) fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            kind: self.kind,
            target: self.target,
            issued_at_version: self.issued_at_version,
            attempt: 0,
            deadline: self.deadline,
            timeout: self.timeout,
            retry: self.retry,
            repeat: self.repeat,
        }
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone)]
pub enum JobOutput {
    Completed,
    Reserved(BackendHandle),
    Health(Vec<HealthReport>),
    Topology(TopologySnapshot),
    SweepDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Retrying { attempt: u32 },
    Completed,
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_) | JobStatus::Cancelled)
    }
}

/// Returned by `submit`, observes the job's status.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, status: watch::Receiver<JobStatus>) -> Self {
        JobHandle { id, status }
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Waits until the job completed, failed or was cancelled.
    ///
    /// Periodic jobs only finish when cancelled or when the scheduler shuts down.
    pub async fn wait(&self) -> JobStatus {
        let mut status = self.status.clone();
        loop {
            let current = status.borrow_and_update().clone();
            if current.is_finished() {
                return current;
            }
            if status.changed().await.is_err() {
                return status.borrow().clone();
            }
        }
    }
}

/// Runs a job. Implemented by the component that owns the side effects.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<JobOutput>;
}

/// Receives the final outcome of every job that was not cancelled.
///
/// Called while the job's key is still held, so outcomes for one reservation are
/// delivered in order.
#[async_trait]
pub trait JobOutcomeListener: Send + Sync {
    async fn on_job_finished(&self, job: &Job, outcome: Result<JobOutput>);
}
