use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::provider::backend::nrm_backend_trait::{BackendOperation, NrmBackend};
use crate::domain::provider::health::health_monitor::HealthMonitor;
use crate::domain::provider::scheduler::job::{Job, JobExecutor, JobKind, JobOutcomeListener, JobOutput};
use crate::domain::provider::state_machine::reservation_state_machine::ReservationStateMachine;
use crate::domain::provider::topology::topology_cache::TopologyCache;
use crate::domain::provider::utils::id::ConnectionId;
use crate::error::{Error, Result};

/// Executes scheduler jobs and hands their outcomes back to the state machine.
///
/// Execution only reads reservations. Every state change goes through
/// [`ReservationStateMachine`].
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    backend: Arc<dyn NrmBackend>,
    state_machine: ReservationStateMachine,
    topology: TopologyCache,
    health: HealthMonitor,
}

impl JobDispatcher {
    pub fn new(
        backend: Arc<dyn NrmBackend>,
        state_machine: ReservationStateMachine,
        topology: TopologyCache,
        health: HealthMonitor,
    ) -> Self {
        JobDispatcher { backend, state_machine, topology, health }
    }

    async fn call_backend(&self, job: &Job, operation: BackendOperation) -> Result<JobOutput> {
        let id = target(job, operation)?;
        let reservation = self.state_machine.store().snapshot(id).await?;

        if job.issued_at_version.is_some_and(|issued| issued > reservation.version) {
            return Err(Error::backend(operation, "issuing transition was never applied", false));
        }

        let handle = || {
            reservation
                .backend_handle
                .clone()
                .ok_or_else(|| Error::backend(operation, "no backend handle, reserve was never confirmed", false))
        };

        match operation {
            BackendOperation::Reserve => Ok(JobOutput::Reserved(self.backend.reserve(id, &reservation.criteria).await?)),
            BackendOperation::Commit => self.backend.commit(&handle()?).await.map(|_| JobOutput::Completed),
            BackendOperation::Provision => self.backend.provision(&handle()?).await.map(|_| JobOutput::Completed),
            BackendOperation::Release => self.backend.release(&handle()?).await.map(|_| JobOutput::Completed),
            BackendOperation::Terminate => self.backend.terminate(&handle()?).await.map(|_| JobOutput::Completed),
        }
    }

    async fn apply_backend_outcome(&self, job: &Job, operation: BackendOperation, outcome: Result<JobOutput>) -> Result<()> {
        let id = target(job, operation)?;
        let outcome = outcome.map(|output| match output {
            JobOutput::Reserved(handle) => Some(handle),
            _ => None,
        });
        self.state_machine.apply_backend_outcome(id, operation, job.issued_at_version, outcome).await
    }

    async fn apply_health(&self, outcome: Result<JobOutput>) -> Result<()> {
        let reports = match outcome? {
            JobOutput::Health(reports) => reports,
            other => {
                log::warn!("Health check produced unexpected output {:?}", other);
                return Ok(());
            }
        };

        for (id, change) in self.health.record(&reports) {
            let detail = reports.iter().find(|report| report.connection_id == id).and_then(|report| report.detail.clone());
            self.state_machine.set_degraded(&id, change, detail).await?;
        }
        Ok(())
    }
}

fn target(job: &Job, operation: BackendOperation) -> Result<&ConnectionId> {
    job.target.as_ref().ok_or_else(|| Error::backend(operation, format!("{} has no target reservation", job.id), false))
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: &Job) -> Result<JobOutput> {
        match job.kind {
            JobKind::BackendCall(operation) => self.call_backend(job, operation).await,
            JobKind::HealthCheck => Ok(JobOutput::Health(self.health.check().await)),
            JobKind::TopologyRefresh { force } => Ok(JobOutput::Topology(self.topology.refresh(force).await?)),
            JobKind::TimeoutSweep => Ok(JobOutput::SweepDue),
        }
    }
}

#[async_trait]
impl JobOutcomeListener for JobDispatcher {
    async fn on_job_finished(&self, job: &Job, outcome: Result<JobOutput>) {
        let applied = match job.kind {
            JobKind::BackendCall(operation) => self.apply_backend_outcome(job, operation, outcome).await,
            JobKind::HealthCheck => self.apply_health(outcome).await,
            JobKind::TopologyRefresh { .. } => match outcome {
                Ok(JobOutput::Topology(snapshot)) => {
                    log::debug!("Topology snapshot version {} is current.", snapshot.version);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            },
            JobKind::TimeoutSweep => match (&job.target, outcome) {
                (_, Err(e)) => Err(e),
                (Some(id), Ok(_)) => self.state_machine.apply_timeout_sweep(id).await.map(|_| ()),
                (None, Ok(_)) => self.state_machine.sweep_expired().await.map(|_| ()),
            },
        };

        match applied {
            Ok(()) => {}
            Err(Error::ReservationNotFound(id)) => log::debug!("{} finished for removed reservation {}.", job.id, id),
            Err(e) => log::warn!("{} ({}) failed: {}", job.id, job.kind, e),
        }
    }
}
