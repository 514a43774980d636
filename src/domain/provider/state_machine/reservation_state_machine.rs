use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::clock::clock::{SharedClock, duration_to_ms};
use crate::domain::provider::backend::nrm_backend_trait::BackendOperation;
use crate::domain::provider::health::health_monitor::HealthChange;
use crate::domain::provider::provider_config::ProviderConfig;
use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::reservation::notification::{
    NotificationKind, NotificationLog, NotificationRecord, ProviderEvent, ResultKind, ResultRecord,
};
use crate::domain::provider::reservation::query::{QueryFilter, QuerySummary, ReservationSummary};
use crate::domain::provider::reservation::reservation::{Reservation, ReservationState};
use crate::domain::provider::reservation::reservation_store::ReservationStore;
use crate::domain::provider::reservation::transition::{ReservationEvent, next_state};
use crate::domain::provider::scheduler::job::{JobHandle, JobKind, JobRequest};
use crate::domain::provider::scheduler::job_scheduler::JobScheduler;
use crate::domain::provider::scheduler::retry_policy::RetryPolicy;
use crate::domain::provider::utils::audit::{AuditEvent, AuditTrail};
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};
use crate::error::{Error, Result};

const SUBMIT_BACKOFF: Duration = Duration::from_millis(50);

/// Owns every reservation state change.
///
/// A transition runs under the reservation's write lock: version check, transition graph,
/// job submission and write-back happen as one step, so a rejected event leaves the
/// reservation untouched. Job outcomes come back through `apply_*` and take the same lock.
#[derive(Debug, Clone)]
pub struct ReservationStateMachine {
    clock: SharedClock,
    store: ReservationStore,
    scheduler: JobScheduler,
    notifications: NotificationLog,
    audit: Option<Arc<AuditTrail>>,
    reserve_timeout: Duration,
    backend_call_timeout: Duration,
    backend_retry: RetryPolicy,
    submit_retry_attempts: u32,
    /// Pending per-reservation timeout sweeps.
    sweep_jobs: Arc<Mutex<HashMap<ConnectionId, JobHandle>>>,
}

impl ReservationStateMachine {
    pub fn new(
        config: &ProviderConfig,
        clock: SharedClock,
        store: ReservationStore,
        scheduler: JobScheduler,
        notifications: NotificationLog,
        audit: Option<Arc<AuditTrail>>,
    ) -> Self {
        ReservationStateMachine {
            clock,
            store,
            scheduler,
            notifications,
            audit,
            reserve_timeout: config.reserve_timeout,
            backend_call_timeout: config.backend_call_timeout,
            backend_retry: config.backend_retry.clone(),
            submit_retry_attempts: config.submit_retry_attempts,
            sweep_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &ReservationStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.notifications.subscribe()
    }

    fn now(&self) -> i64 {
        self.clock.get_current_time_in_ms()
    }

    /// Creates a reservation and moves it to `Reserved`.
    ///
    /// Schedules the backend `reserve` call and the timeout sweep at `reserve_deadline`.
    pub async fn reserve(
        &self,
        criteria: Criteria,
        global_reservation_id: Option<String>,
        description: Option<String>,
    ) -> Result<Reservation> {
        criteria.validate()?;

        let id = ConnectionId::generate();
        let now = self.now();
        self.store.insert(Reservation::new(id.clone(), criteria, now, global_reservation_id, description))?;
        self.store.notify(&id, ReservationState::Created);

        let reserve_timeout = duration_to_ms(self.reserve_timeout);
        let result = self
            .transition(&id, ReservationEvent::Reserve, None, |reservation| {
                let deadline = reservation.updated_at + reserve_timeout;
                reservation.reserve_deadline = Some(deadline);
                Ok(vec![
                    self.backend_request(BackendOperation::Reserve, &reservation.id, reservation.version),
                    JobRequest::new(JobKind::TimeoutSweep)
                        .for_reservation(reservation.id.clone(), reservation.version)
                        .run_at(deadline),
                ])
            })
            .await;

        match result {
            Ok((reservation, mut handles)) => {
                if let Some(sweep) = handles.pop() {
                    self.remember_sweep(&id, sweep);
                }
                Ok(reservation)
            }
            Err(e) => {
                if let Err(remove_error) = self.store.remove(&id) {
                    log::error!("Could not remove rejected reservation {}: {}", id, remove_error);
                }
                Err(e)
            }
        }
    }

    /// Commits a held reservation. Fails with `Timeout` once the reserve deadline passed.
    ///
    /// Deadline check and commit happen under one lock acquisition, so a concurrent timeout
    /// sweep either sees `Committed` or has already produced `Expired`.
    pub async fn reserve_commit(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        let mut attempt = 0;
        loop {
            let entry = self.store.entry(id)?;
            let mut guard = entry.write().await;
            check_version(&guard, expected_version)?;

            let now = self.now();
            if guard.state == ReservationState::Expired || guard.is_past_deadline(now) {
                if guard.state == ReservationState::Reserved {
                    let from = guard.state;
                    guard.apply(ReservationEvent::ReserveTimeout, ReservationState::Expired, now);
                    self.after_transition(&guard, from, ReservationEvent::ReserveTimeout, None);
                    let expired = guard.clone();
                    drop(guard);

                    self.cancel_sweep(id);
                    self.add_notification(&expired, NotificationKind::ReserveTimeout, Some("commit arrived after the reserve deadline".into()));
                    self.add_result(&expired, ResultKind::ReserveCommitFailed, Some("reserve timeout".into()));
                } else {
                    let expired = guard.clone();
                    drop(guard);
                    self.add_result(&expired, ResultKind::ReserveCommitFailed, Some("reservation already expired".into()));
                }

                return Err(Error::Timeout { id: id.clone(), reason: "reserve deadline passed before commit".to_string() });
            }

            let transitioned = self.transition_locked(&mut guard, ReservationEvent::ReserveCommit, expected_version, |reservation| {
                Ok(vec![self.backend_request(BackendOperation::Commit, &reservation.id, reservation.version)])
            });
            match transitioned {
                Ok((from, _)) => {
                    self.after_transition(&guard, from, ReservationEvent::ReserveCommit, None);
                    let committed = guard.clone();
                    drop(guard);
                    self.cancel_sweep(id);
                    return Ok(committed);
                }
                Err(e) => {
                    drop(guard);
                    attempt = self.await_submission_retry(e, attempt).await?;
                }
            }
        }
    }

    pub async fn provision(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        let (reservation, _) = self
            .transition(id, ReservationEvent::Provision, expected_version, |reservation| {
                Ok(vec![self.backend_request(BackendOperation::Provision, &reservation.id, reservation.version)])
            })
            .await?;
        Ok(reservation)
    }

    pub async fn release(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        let (reservation, _) = self
            .transition(id, ReservationEvent::Release, expected_version, |reservation| {
                Ok(vec![self.backend_request(BackendOperation::Release, &reservation.id, reservation.version)])
            })
            .await?;
        Ok(reservation)
    }

    /// Ends the reservation. The backend is only asked to terminate if it ever held
    /// resources for it, i.e. the reservation passed `Committed`.
    pub async fn terminate(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        let (reservation, handles) = self
            .transition(id, ReservationEvent::Terminate, expected_version, |reservation| {
                if reservation.allocated {
                    Ok(vec![self.backend_request(BackendOperation::Terminate, &reservation.id, reservation.version)])
                } else {
                    Ok(Vec::new())
                }
            })
            .await?;

        self.cancel_sweep(id);
        if handles.is_empty() {
            self.add_result(&reservation, ResultKind::TerminateConfirmed, None);
        }
        Ok(reservation)
    }

    /// Applies the result of a backend call issued at `issued_at_version`.
    pub async fn apply_backend_outcome(
        &self,
        id: &ConnectionId,
        operation: BackendOperation,
        issued_at_version: Option<u64>,
        outcome: Result<Option<BackendHandle>>,
    ) -> Result<()> {
        let entry = self.store.entry(id)?;
        let mut guard = entry.write().await;
        let now = self.now();

        let error = match outcome {
            Ok(handle) => {
                match operation {
                    BackendOperation::Reserve => {
                        if handle.is_some() {
                            guard.backend_handle = handle;
                            guard.updated_at = now;
                        }
                        let snapshot = guard.clone();
                        drop(guard);
                        self.add_result(&snapshot, ResultKind::ReserveConfirmed, None);
                    }
                    BackendOperation::Commit => {
                        let snapshot = guard.clone();
                        drop(guard);
                        self.add_result(&snapshot, ResultKind::ReserveCommitConfirmed, None);
                    }
                    BackendOperation::Terminate => {
                        let snapshot = guard.clone();
                        drop(guard);
                        self.add_result(&snapshot, ResultKind::TerminateConfirmed, None);
                    }
                    BackendOperation::Provision | BackendOperation::Release => {
                        if issued_at_version.is_some_and(|issued| issued != guard.version) {
                            tracing::info!(
                                connection_id = %id,
                                operation = ?operation,
                                issued_at_version = ?issued_at_version,
                                current_version = guard.version,
                                "Discarding stale backend confirmation"
                            );
                            return Ok(());
                        }

                        let event = ReservationEvent::BackendConfirmed(operation);
                        let Some(to) = next_state(guard.state, event) else {
                            log::warn!("Backend confirmed {:?} for {} in state {}, ignored.", operation, id, guard.state);
                            return Ok(());
                        };

                        let from = guard.state;
                        guard.apply(event, to, now);
                        self.after_transition(&guard, from, event, None);
                        let snapshot = guard.clone();
                        drop(guard);

                        let kind = match operation {
                            BackendOperation::Provision => ResultKind::ProvisionConfirmed,
                            _ => ResultKind::ReleaseConfirmed,
                        };
                        self.add_result(&snapshot, kind, None);
                    }
                }
                return Ok(());
            }
            Err(e) => e,
        };

        let reason = error.to_string();
        let event = ReservationEvent::BackendFailed(operation);
        let from = guard.state;
        guard.last_error = Some(reason.clone());
        guard.updated_at = now;

        let transitioned = match next_state(guard.state, event) {
            Some(to) => {
                guard.apply(event, to, now);
                self.after_transition(&guard, from, event, Some(&reason));
                true
            }
            None => false,
        };
        let snapshot = guard.clone();
        drop(guard);

        if transitioned {
            self.cancel_sweep(id);
        } else {
            self.audit(&snapshot, &format!("{:?}", event), Some(from), None, Some(&reason));
            log::warn!("Backend {:?} failed for {} in terminal state {}: {}", operation, id, from, reason);
        }

        let kind = match operation {
            BackendOperation::Reserve => ResultKind::ReserveFailed,
            BackendOperation::Commit => ResultKind::ReserveCommitFailed,
            _ => ResultKind::Error,
        };
        self.add_result(&snapshot, kind, Some(reason.clone()));
        self.add_notification(&snapshot, NotificationKind::ErrorEvent, Some(reason));
        Ok(())
    }

    /// Expires `id` if it is still `Reserved` and its deadline passed.
    ///
    /// Returns `true` if this call expired the reservation. Loses cleanly against a commit that
    /// took the lock first.
    pub async fn apply_timeout_sweep(&self, id: &ConnectionId) -> Result<bool> {
        let entry = self.store.entry(id)?;
        let mut guard = entry.write().await;
        let now = self.now();

        if !guard.is_past_deadline(now) {
            log::debug!("Timeout sweep for {} found state {}, nothing to do.", id, guard.state);
            return Ok(false);
        }

        let from = guard.state;
        guard.apply(ReservationEvent::ReserveTimeout, ReservationState::Expired, now);
        self.after_transition(&guard, from, ReservationEvent::ReserveTimeout, None);
        let snapshot = guard.clone();
        drop(guard);

        self.forget_sweep(id);
        self.add_notification(&snapshot, NotificationKind::ReserveTimeout, None);
        Ok(true)
    }

    /// Expires every reservation past its reserve deadline.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.now();
        let mut expired = 0;
        for reservation in self.store.snapshots().await? {
            if reservation.is_past_deadline(now) && self.apply_timeout_sweep(&reservation.id).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            log::info!("Timeout sweep expired {} reservation(s).", expired);
        }
        Ok(expired)
    }

    /// Sets or clears the observational degraded flag.
    pub async fn set_degraded(&self, id: &ConnectionId, change: HealthChange, detail: Option<String>) -> Result<()> {
        let entry = self.store.entry(id)?;
        let mut guard = entry.write().await;
        let degraded = change == HealthChange::Degraded;
        if guard.degraded == degraded {
            return Ok(());
        }

        guard.degraded = degraded;
        guard.updated_at = self.now();
        let snapshot = guard.clone();
        drop(guard);

        let kind = match change {
            HealthChange::Degraded => NotificationKind::HealthDegraded,
            HealthChange::Restored => NotificationKind::HealthRestored,
        };
        self.add_notification(&snapshot, kind, detail);
        Ok(())
    }

    /// Re-creates the scheduled work of restored reservations. Returns the number of jobs.
    pub async fn recover(&self) -> Result<usize> {
        let mut submitted = 0;

        for reservation in self.store.snapshots().await? {
            let id = &reservation.id;
            let version = reservation.version;
            let mut requests = Vec::new();

            match reservation.state {
                ReservationState::Reserved => {
                    if reservation.backend_handle.is_none() {
                        requests.push(self.backend_request(BackendOperation::Reserve, id, version));
                    }
                    if let Some(deadline) = reservation.reserve_deadline {
                        let sweep = JobRequest::new(JobKind::TimeoutSweep).for_reservation(id.clone(), version).run_at(deadline);
                        let handle = self.submit_with_retry(sweep).await?;
                        self.remember_sweep(id, handle);
                        submitted += 1;
                    }
                }
                ReservationState::Provisioning => {
                    requests.push(self.backend_request(BackendOperation::Provision, id, version));
                }
                ReservationState::Releasing => {
                    requests.push(self.backend_request(BackendOperation::Release, id, version));
                }
                _ => {}
            }

            for request in requests {
                log::info!("Recovering {} for reservation {} ({}).", request.kind, id, reservation.state);
                self.submit_with_retry(request).await?;
                submitted += 1;
            }
        }

        Ok(submitted)
    }

    pub async fn query_state(&self, id: &ConnectionId) -> Result<Reservation> {
        self.store.snapshot(id).await
    }

    pub fn query_results(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<ResultRecord>> {
        if !self.store.contains(id) {
            return Err(Error::ReservationNotFound(id.clone()));
        }
        self.notifications.results(id, since_id)
    }

    pub fn query_notifications(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<NotificationRecord>> {
        if !self.store.contains(id) {
            return Err(Error::ReservationNotFound(id.clone()));
        }
        self.notifications.notifications(id, since_id)
    }

    pub async fn query_summary(&self, filter: &QueryFilter) -> Result<QuerySummary> {
        let mut reservations = Vec::new();
        for reservation in self.store.snapshots().await? {
            if !filter.matches(&reservation) {
                continue;
            }
            let (last_result_id, last_notification_id) = self.notifications.max_ids(&reservation.id)?;
            reservations.push(ReservationSummary { reservation, last_result_id, last_notification_id });
        }

        reservations.sort_by_key(|summary| summary.reservation.created_at);
        let last_modified = reservations.iter().map(|summary| summary.reservation.updated_at).max();
        Ok(QuerySummary { reservations, last_modified })
    }

    /// Compare-and-transition under the reservation's write lock.
    ///
    /// The lock is never held while waiting for queue space: on a full queue it is released,
    /// and the next attempt checks version and state again.
    async fn transition<F>(
        &self,
        id: &ConnectionId,
        event: ReservationEvent,
        expected_version: Option<u64>,
        prepare: F,
    ) -> Result<(Reservation, Vec<JobHandle>)>
    where
        F: Fn(&mut Reservation) -> Result<Vec<JobRequest>>,
    {
        let mut attempt = 0;
        loop {
            let entry = self.store.entry(id)?;
            let mut guard = entry.write().await;
            match self.transition_locked(&mut guard, event, expected_version, &prepare) {
                Ok((from, handles)) => {
                    self.after_transition(&guard, from, event, None);
                    return Ok((guard.clone(), handles));
                }
                Err(e) => {
                    drop(guard);
                    attempt = self.await_submission_retry(e, attempt).await?;
                }
            }
        }
    }

    /// Transition body, the caller holds the write lock on `reservation`. Never waits.
    ///
    /// `prepare` sees the reservation with the transition already applied and returns the jobs
    /// to submit. The new state is only written back once every job was accepted, otherwise
    /// the accepted ones are cancelled and `reservation` stays as it was.
    fn transition_locked<F>(
        &self,
        reservation: &mut Reservation,
        event: ReservationEvent,
        expected_version: Option<u64>,
        prepare: F,
    ) -> Result<(ReservationState, Vec<JobHandle>)>
    where
        F: FnOnce(&mut Reservation) -> Result<Vec<JobRequest>>,
    {
        check_version(reservation, expected_version)?;

        let from = reservation.state;
        let Some(to) = next_state(from, event) else {
            log::info!("Rejected {:?} for reservation {} in state {}.", event, reservation.id, from);
            return Err(Error::InvalidTransition { id: reservation.id.clone(), event, state: from });
        };

        let mut updated = reservation.clone();
        updated.apply(event, to, self.now());
        let requests = prepare(&mut updated)?;

        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            match self.scheduler.submit(request) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        self.scheduler.cancel(handle);
                    }
                    log::warn!("Could not schedule work for {:?} on {}: {}", event, reservation.id, e);
                    return Err(e);
                }
            }
        }

        *reservation = updated;
        Ok((from, handles))
    }

    /// Waits before another submission attempt if `error` is a full queue and attempts are
    /// left. Returns the next attempt number, or `error` itself.
    async fn await_submission_retry(&self, error: Error, attempt: u32) -> Result<u32> {
        match error {
            Error::CapacityExceeded { capacity } if attempt < self.submit_retry_attempts => {
                let attempt = attempt + 1;
                tracing::debug!(capacity, attempt, "Job queue full, retrying submission");
                tokio::time::sleep(SUBMIT_BACKOFF * attempt).await;
                Ok(attempt)
            }
            error => Err(error),
        }
    }

    /// Submits `request` outside of any reservation lock, retrying on a full queue.
    async fn submit_with_retry(&self, request: JobRequest) -> Result<JobHandle> {
        let mut attempt = 0;
        loop {
            match self.scheduler.submit(request.clone()) {
                Ok(handle) => return Ok(handle),
                Err(e) => attempt = self.await_submission_retry(e, attempt).await?,
            }
        }
    }

    fn backend_request(&self, operation: BackendOperation, id: &ConnectionId, version: u64) -> JobRequest {
        JobRequest::new(JobKind::BackendCall(operation))
            .for_reservation(id.clone(), version)
            .with_timeout(self.backend_call_timeout)
            .with_retry(self.backend_retry.clone())
    }

    /// Logs, notifies listeners and audits. Called with the write lock held, so listeners see
    /// the states of one reservation in order.
    fn after_transition(&self, reservation: &Reservation, from: ReservationState, event: ReservationEvent, error: Option<&str>) {
        tracing::info!(
            connection_id = %reservation.id,
            event = ?event,
            from = %from,
            to = %reservation.state,
            version = reservation.version,
            "Reservation transition"
        );
        self.store.notify(&reservation.id, reservation.state);
        self.audit(reservation, &format!("{:?}", event), Some(from), Some(reservation.state), error);
    }

    fn audit(
        &self,
        reservation: &Reservation,
        event: &str,
        from: Option<ReservationState>,
        to: Option<ReservationState>,
        error: Option<&str>,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(AuditEvent {
                time: reservation.updated_at,
                connection_id: reservation.id.clone(),
                event: event.to_string(),
                from,
                to,
                version: Some(reservation.version),
                error: error.map(str::to_string),
            });
        }
    }

    fn add_result(&self, reservation: &Reservation, kind: ResultKind, detail: Option<String>) {
        if let Err(e) = self.notifications.add_result(
            &reservation.id,
            kind,
            detail,
            self.now(),
            reservation.state,
            reservation.version,
        ) {
            log::error!("Could not record {:?} for {}: {}", kind, reservation.id, e);
        }
    }

    fn add_notification(&self, reservation: &Reservation, kind: NotificationKind, detail: Option<String>) {
        if let Err(e) = self.notifications.add_notification(
            &reservation.id,
            kind,
            detail,
            self.now(),
            reservation.state,
            reservation.version,
        ) {
            log::error!("Could not record {:?} for {}: {}", kind, reservation.id, e);
        }
    }

    fn remember_sweep(&self, id: &ConnectionId, handle: JobHandle) {
        let mut sweeps = match self.sweep_jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sweeps.insert(id.clone(), handle);
    }

    fn forget_sweep(&self, id: &ConnectionId) -> Option<JobHandle> {
        let mut sweeps = match self.sweep_jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sweeps.remove(id)
    }

    fn cancel_sweep(&self, id: &ConnectionId) {
        if let Some(handle) = self.forget_sweep(id) {
            self.scheduler.cancel(&handle);
        }
    }
}

fn check_version(reservation: &Reservation, expected_version: Option<u64>) -> Result<()> {
    match expected_version {
        Some(expected) if expected != reservation.version => Err(Error::StaleVersion {
            id: reservation.id.clone(),
            expected,
            actual: reservation.version,
        }),
        _ => Ok(()),
    }
}
