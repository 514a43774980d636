use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::clock::clock::{SharedClock, duration_to_ms, remaining_until};
use crate::domain::provider::provider_config::SchedulerConfig;
use crate::domain::provider::scheduler::job::{
    Job, JobExecutor, JobHandle, JobKey, JobKind, JobOutcomeListener, JobRequest, JobStatus,
};
use crate::domain::provider::utils::id::JobId;
use crate::error::{Error, Result};

#[derive(Debug)]
struct QueuedJob {
    job: Job,
    status: watch::Sender<JobStatus>,
}

#[derive(Debug)]
struct DelayedJob {
    queued: QueuedJob,
    /// Retries go back to the head of the ready queue and keep their key held meanwhile.
    is_retry: bool,
}

#[derive(Debug)]
struct SchedulerState {
    ready: VecDeque<QueuedJob>,
    delayed: BTreeMap<(i64, JobId), DelayedJob>,
    /// Keys of jobs that are running or waiting for a retry.
    held_keys: HashSet<JobKey>,
    running: HashSet<JobId>,
    /// Running jobs whose result must be discarded.
    cancelled: HashSet<JobId>,
    next_id: u64,
    accepting: bool,
}

impl SchedulerState {
    /// Pops the first ready job whose key is free. Earlier jobs with the same key share its
    /// held status, so this keeps per-key submission order.
    fn take_runnable(&mut self) -> Option<QueuedJob> {
        let position = self.ready.iter().position(|queued| !self.held_keys.contains(&queued.job.key()))?;
        let queued = self.ready.remove(position)?;
        self.held_keys.insert(queued.job.key());
        self.running.insert(queued.job.id);
        Some(queued)
    }

    /// Moves every delayed job that is due at `now` to the ready queue.
    fn promote_due(&mut self, now: i64) -> usize {
        let due: Vec<(i64, JobId)> = self.delayed.range(..=(now, JobId(u64::MAX))).map(|(key, _)| *key).collect();

        let mut retries = Vec::new();
        for key in &due {
            if let Some(delayed) = self.delayed.remove(key) {
                if delayed.is_retry {
                    self.held_keys.remove(&delayed.queued.job.key());
                    retries.push(delayed.queued);
                } else {
                    self.ready.push_back(delayed.queued);
                }
            }
        }

        for queued in retries.into_iter().rev() {
            self.ready.push_front(queued);
        }

        due.len()
    }

    fn next_due(&self) -> Option<i64> {
        self.delayed.keys().next().map(|(run_at, _)| *run_at)
    }
}

#[derive(Debug)]
struct SchedulerInner {
    config: SchedulerConfig,
    clock: SharedClock,
    state: Mutex<SchedulerState>,
    /// Wakes workers when a job may have become runnable.
    work_available: Notify,
    /// Wakes the timer when the delayed set changed.
    timer_changed: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded worker pool with per-key FIFO ordering, delayed and periodic jobs.
///
/// `submit` never blocks: a full ready queue is reported as `CapacityExceeded`. Delayed jobs
/// wait in a timer set outside of the capacity bound.
#[derive(Debug, Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig, clock: SharedClock) -> Self {
        JobScheduler {
            inner: Arc::new(SchedulerInner {
                config,
                clock,
                state: Mutex::new(SchedulerState {
                    ready: VecDeque::new(),
                    delayed: BTreeMap::new(),
                    held_keys: HashSet::new(),
                    running: HashSet::new(),
                    cancelled: HashSet::new(),
                    next_id: 1,
                    accepting: true,
                }),
                work_available: Notify::new(),
                timer_changed: Notify::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the workers and the timer task. Must be called from within a tokio runtime.
    pub fn start(&self, executor: Arc<dyn JobExecutor>, listener: Arc<dyn JobOutcomeListener>) {
        let mut tasks = lock_recover(&self.inner.tasks);

        for worker in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            let executor = executor.clone();
            let listener = listener.clone();
            tasks.push(tokio::spawn(async move { worker_loop(worker, inner, executor, listener).await }));
        }

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move { timer_loop(inner).await }));

        log::info!(
            "JobScheduler started with {} workers (queue capacity {}).",
            self.inner.config.worker_count,
            self.inner.config.queue_capacity
        );
    }

    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let now = self.inner.clock.get_current_time_in_ms();
        let mut state = lock_recover(&self.inner.state);

        if !state.accepting {
            return Err(Error::ShuttingDown);
        }

        let delayed_until = request.run_at.filter(|run_at| *run_at > now);
        if delayed_until.is_none() && state.ready.len() >= self.inner.config.queue_capacity {
            return Err(Error::CapacityExceeded { capacity: self.inner.config.queue_capacity });
        }

        let id = JobId(state.next_id);
        state.next_id += 1;

        let (status, receiver) = watch::channel(JobStatus::Pending);
        let job = request.into_job(id);
        log::debug!("Submitting {} ({}) for {:?}", id, job.kind, job.target);

        match delayed_until {
            Some(run_at) => {
                state.delayed.insert((run_at, id), DelayedJob { queued: QueuedJob { job, status }, is_retry: false });
                drop(state);
                self.inner.timer_changed.notify_one();
            }
            None => {
                state.ready.push_back(QueuedJob { job, status });
                drop(state);
                self.inner.work_available.notify_one();
            }
        }

        Ok(JobHandle::new(id, receiver))
    }

    /// Best-effort cancel. A running job keeps running, only its result is discarded.
    ///
    /// Returns `false` if the job already finished.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        let mut state = lock_recover(&self.inner.state);

        if let Some(position) = state.ready.iter().position(|queued| queued.job.id == handle.id) {
            if let Some(queued) = state.ready.remove(position) {
                queued.status.send_replace(JobStatus::Cancelled);
            }
            drop(state);
            self.inner.work_available.notify_one();
            return true;
        }

        let delayed_key = state.delayed.iter().find(|(_, delayed)| delayed.queued.job.id == handle.id).map(|(key, _)| *key);
        if let Some(key) = delayed_key {
            if let Some(delayed) = state.delayed.remove(&key) {
                if delayed.is_retry {
                    state.held_keys.remove(&delayed.queued.job.key());
                }
                delayed.queued.status.send_replace(JobStatus::Cancelled);
            }
            drop(state);
            self.inner.work_available.notify_one();
            return true;
        }

        if state.running.contains(&handle.id) {
            state.cancelled.insert(handle.id);
            return true;
        }

        false
    }

    /// Jobs ready to run (not counting delayed ones).
    pub fn queue_len(&self) -> usize {
        lock_recover(&self.inner.state).ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        lock_recover(&self.inner.state).delayed.len()
    }

    pub fn running_len(&self) -> usize {
        lock_recover(&self.inner.state).running.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.queue_capacity
    }

    /// Stops accepting jobs, cancels everything that has not started and waits for the
    /// running jobs to finish.
    pub async fn shutdown(&self) {
        {
            let mut state = lock_recover(&self.inner.state);
            state.accepting = false;
            for queued in state.ready.drain(..) {
                queued.status.send_replace(JobStatus::Cancelled);
            }
            for (_, delayed) in std::mem::take(&mut state.delayed) {
                delayed.queued.status.send_replace(JobStatus::Cancelled);
            }
        }
        self.inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = lock_recover(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        log::info!("JobScheduler stopped.");
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<SchedulerInner>,
    executor: Arc<dyn JobExecutor>,
    listener: Arc<dyn JobOutcomeListener>,
) {
    log::debug!("Worker {} started.", worker);

    loop {
        let next = {
            let mut state = lock_recover(&inner.state);
            let next = state.take_runnable();
            if next.is_some() && !state.ready.is_empty() {
                inner.work_available.notify_one();
            }
            next
        };

        match next {
            Some(queued) => run_job(&inner, queued, executor.as_ref(), listener.as_ref()).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.work_available.notified() => {}
                }
            }
        }
    }

    log::debug!("Worker {} stopped.", worker);
}

async fn run_job(inner: &SchedulerInner, queued: QueuedJob, executor: &dyn JobExecutor, listener: &dyn JobOutcomeListener) {
    let QueuedJob { mut job, status } = queued;
    job.attempt += 1;

    let now = inner.clock.get_current_time_in_ms();
    let missed_deadline = job.deadline.is_some_and(|deadline| now > deadline);

    let outcome = if missed_deadline {
        Err(Error::DeadlineExceeded { job: job.id })
    } else {
        status.send_replace(JobStatus::Running);
        match job.timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.execute(&job)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(timeout_error(&job, limit)),
            },
            None => executor.execute(&job).await,
        }
    };

    let key = job.key();

    {
        let mut state = lock_recover(&inner.state);

        if state.cancelled.remove(&job.id) {
            log::info!("{} ({}) was cancelled while running, result discarded.", job.id, job.kind);
            state.running.remove(&job.id);
            state.held_keys.remove(&key);
            drop(state);
            status.send_replace(JobStatus::Cancelled);
            inner.work_available.notify_one();
            return;
        }

        if let Err(e) = &outcome {
            if !missed_deadline && e.is_transient() && job.retry.should_retry(job.attempt) && state.accepting {
                let backoff = job.retry.backoff(job.attempt);
                let run_at = inner.clock.get_current_time_in_ms() + duration_to_ms(backoff);
                tracing::warn!(
                    job = %job.id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    max_attempts = job.retry.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying"
                );

                state.running.remove(&job.id);
                status.send_replace(JobStatus::Retrying { attempt: job.attempt });
                state.delayed.insert((run_at, job.id), DelayedJob { queued: QueuedJob { job, status }, is_retry: true });
                drop(state);

                inner.timer_changed.notify_one();
                return;
            }
        }
    }

    let final_status = match &outcome {
        Ok(_) => JobStatus::Completed,
        Err(e) => JobStatus::Failed(e.to_string()),
    };

    listener.on_job_finished(&job, outcome).await;

    let mut state = lock_recover(&inner.state);
    state.running.remove(&job.id);
    state.held_keys.remove(&key);

    let cancelled = state.cancelled.remove(&job.id);
    match job.repeat {
        Some(interval) if state.accepting && !cancelled => {
            let run_at = inner.clock.get_current_time_in_ms() + duration_to_ms(interval);
            job.attempt = 0;
            status.send_replace(JobStatus::Pending);
            state.delayed.insert((run_at, job.id), DelayedJob { queued: QueuedJob { job, status }, is_retry: false });
            drop(state);
            inner.timer_changed.notify_one();
        }
        _ => {
            drop(state);
            status.send_replace(if cancelled { JobStatus::Cancelled } else { final_status });
        }
    }

    inner.work_available.notify_one();
}

fn timeout_error(job: &Job, limit: Duration) -> Error {
    match job.kind {
        JobKind::BackendCall(operation) => Error::backend(operation, format!("no answer within {:?}", limit), true),
        _ => Error::DeadlineExceeded { job: job.id },
    }
}

async fn timer_loop(inner: Arc<SchedulerInner>) {
    let resolution = inner.config.timer_resolution;

    loop {
        let now = inner.clock.get_current_time_in_ms();
        let (promoted, next_due) = {
            let mut state = lock_recover(&inner.state);
            let promoted = state.promote_due(now);
            (promoted, state.next_due())
        };

        for _ in 0..promoted {
            inner.work_available.notify_one();
        }

        let sleep_for = next_due.map(|due| remaining_until(due, now).min(resolution)).unwrap_or(resolution);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.timer_changed.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    log::debug!("Timer stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::clock::WallClock;
    use crate::domain::provider::backend::nrm_backend_trait::BackendOperation;
    use crate::domain::provider::scheduler::job::JobOutput;
    use crate::domain::provider::scheduler::retry_policy::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    struct FlakyExecutor {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl JobExecutor for FlakyExecutor {
        async fn execute(&self, _job: &Job) -> Result<JobOutput> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(Error::backend(BackendOperation::Release, "link flapping", true));
            }
            Ok(JobOutput::Completed)
        }
    }

    struct Ignore;

    #[async_trait]
    impl JobOutcomeListener for Ignore {
        async fn on_job_finished(&self, _job: &Job, _outcome: Result<JobOutput>) {}
    }

    #[test]
    fn test_retries_go_to_the_front() {
        let mut state = SchedulerState {
            ready: VecDeque::new(),
            delayed: BTreeMap::new(),
            held_keys: HashSet::new(),
            running: HashSet::new(),
            cancelled: HashSet::new(),
            next_id: 1,
            accepting: true,
        };
        let (first, _) = watch::channel(JobStatus::Pending);
        let (retry, _) = watch::channel(JobStatus::Pending);
        state.ready.push_back(QueuedJob { job: JobRequest::new(JobKind::HealthCheck).into_job(JobId(1)), status: first });

        let retried = JobRequest::new(JobKind::TimeoutSweep).into_job(JobId(2));
        state.held_keys.insert(retried.key());
        state.delayed.insert((10, JobId(2)), DelayedJob { queued: QueuedJob { job: retried, status: retry }, is_retry: true });

        assert_eq!(state.promote_due(5), 0);
        assert_eq!(state.promote_due(10), 1);
        assert_eq!(state.ready.front().map(|queued| queued.job.id), Some(JobId(2)));
        assert!(state.held_keys.is_empty());
        assert_eq!(state.next_due(), None);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_retry_is_logged() {
        let scheduler = JobScheduler::new(
            SchedulerConfig { worker_count: 1, queue_capacity: 4, timer_resolution: Duration::from_millis(5) },
            WallClock::shared(),
        );
        scheduler.start(Arc::new(FlakyExecutor { failures_left: AtomicU32::new(1) }), Arc::new(Ignore));

        let retry = RetryPolicy { max_attempts: 2, initial_backoff: Duration::ZERO, max_backoff: Duration::ZERO, multiplier: 1.0 };
        let handle = scheduler.submit(JobRequest::new(JobKind::HealthCheck).with_retry(retry)).unwrap();

        assert_eq!(handle.wait().await, JobStatus::Completed);
        assert!(logs_contain("Job failed, retrying"));
        assert!(logs_contain("link flapping"));

        scheduler.shutdown().await;
    }
}
