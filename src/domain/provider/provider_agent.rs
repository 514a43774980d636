use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::domain::clock::clock::{SharedClock, duration_to_ms};
use crate::domain::provider::backend::nrm_backend_trait::NrmBackend;
use crate::domain::provider::health::health_monitor::HealthMonitor;
use crate::domain::provider::provider_config::ProviderConfig;
use crate::domain::provider::reservation::active_reservation_listener::ActiveReservationListener;
use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::reservation::notification::{NotificationLog, NotificationRecord, ProviderEvent, ResultRecord};
use crate::domain::provider::reservation::query::{QueryFilter, QuerySummary};
use crate::domain::provider::reservation::reservation::Reservation;
use crate::domain::provider::reservation::reservation_store::ReservationStore;
use crate::domain::provider::scheduler::job::{JobHandle, JobKind, JobRequest, JobStatus};
use crate::domain::provider::scheduler::job_scheduler::JobScheduler;
use crate::domain::provider::state_machine::job_dispatcher::JobDispatcher;
use crate::domain::provider::state_machine::reservation_state_machine::ReservationStateMachine;
use crate::domain::provider::topology::topology_cache::{TopologyCache, TopologySnapshot};
use crate::domain::provider::utils::audit::AuditTrail;
use crate::domain::provider::utils::id::ConnectionId;
use crate::error::{Error, Result};

/// The provider side of the connection service.
///
/// Every `submit_*` call returns as soon as the transition was accepted; backend outcomes
/// arrive later as results and notifications (see [`ProviderAgent::subscribe`]).
#[derive(Debug)]
pub struct ProviderAgent {
    clock: SharedClock,
    scheduler: JobScheduler,
    state_machine: ReservationStateMachine,
    topology: TopologyCache,
    active: ActiveReservationListener,
    audit: Option<Arc<AuditTrail>>,
    backend_call_timeout: Duration,
    periodic_jobs: Vec<JobHandle>,
}

impl ProviderAgent {
    pub async fn start(config: ProviderConfig, backend: Arc<dyn NrmBackend>, clock: SharedClock) -> Result<Self> {
        Self::start_with_records(config, backend, clock, Vec::new()).await
    }

    /// Starts from previously exported reservations and re-creates the work they were waiting for.
    pub async fn start_with_records(
        config: ProviderConfig,
        backend: Arc<dyn NrmBackend>,
        clock: SharedClock,
        records: Vec<Reservation>,
    ) -> Result<Self> {
        let audit = match &config.audit_file {
            Some(path) => Some(Arc::new(AuditTrail::init(path)?)),
            None => None,
        };

        let store = ReservationStore::new();
        let active = ActiveReservationListener::new();
        store.add_listener(Arc::new(active.clone()));
        let restored = store.restore(records)?;

        let scheduler = JobScheduler::new(config.scheduler.clone(), clock.clone());
        let state_machine = ReservationStateMachine::new(
            &config,
            clock.clone(),
            store.clone(),
            scheduler.clone(),
            NotificationLog::new(),
            audit.clone(),
        );
        let topology = TopologyCache::new(backend.clone(), clock.clone(), config.topology_freshness);
        let health = HealthMonitor::new(
            backend.clone(),
            topology.clone(),
            store,
            active.clone(),
            config.health_check_via_topology,
            config.health_failure_threshold,
            config.backend_call_timeout,
        );

        let dispatcher = Arc::new(JobDispatcher::new(backend.clone(), state_machine.clone(), topology.clone(), health));
        scheduler.start(dispatcher.clone(), dispatcher);

        let recovered = state_machine.recover().await?;

        let mut agent = ProviderAgent {
            clock,
            scheduler,
            state_machine,
            topology,
            active,
            audit,
            backend_call_timeout: config.backend_call_timeout,
            periodic_jobs: Vec::new(),
        };
        agent.schedule_periodic_jobs(&config)?;

        log::info!(
            "Provider agent started with backend '{}': {} reservation(s) restored, {} job(s) recovered.",
            backend.name(),
            restored,
            recovered
        );
        Ok(agent)
    }

    fn schedule_periodic_jobs(&mut self, config: &ProviderConfig) -> Result<()> {
        let now = self.clock.get_current_time_in_ms();
        let mut requests = Vec::new();

        // No job-level timeout, the monitor bounds each health call itself.
        if let Some(interval) = config.health_check_interval {
            requests.push(JobRequest::new(JobKind::HealthCheck).run_at(now + duration_to_ms(interval)).every(interval));
        }
        if !config.topology_freshness.is_zero() {
            requests.push(
                JobRequest::new(JobKind::TopologyRefresh { force: false })
                    .run_at(now + duration_to_ms(config.topology_freshness))
                    .with_timeout(config.backend_call_timeout)
                    .every(config.topology_freshness),
            );
        }
        if let Some(interval) = config.timeout_sweep_interval {
            requests.push(JobRequest::new(JobKind::TimeoutSweep).run_at(now + duration_to_ms(interval)).every(interval));
        }

        for request in requests {
            self.periodic_jobs.push(self.scheduler.submit(request)?);
        }
        Ok(())
    }

    pub async fn submit_reserve(
        &self,
        criteria: Criteria,
        global_reservation_id: Option<String>,
        description: Option<String>,
    ) -> Result<Reservation> {
        self.state_machine.reserve(criteria, global_reservation_id, description).await
    }

    pub async fn submit_reserve_commit(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        self.state_machine.reserve_commit(id, expected_version).await
    }

    pub async fn submit_provision(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        self.state_machine.provision(id, expected_version).await
    }

    pub async fn submit_release(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        self.state_machine.release(id, expected_version).await
    }

    pub async fn submit_terminate(&self, id: &ConnectionId, expected_version: Option<u64>) -> Result<Reservation> {
        self.state_machine.terminate(id, expected_version).await
    }

    pub async fn query_state(&self, id: &ConnectionId) -> Result<Reservation> {
        self.state_machine.query_state(id).await
    }

    pub fn query_results(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<ResultRecord>> {
        self.state_machine.query_results(id, since_id)
    }

    pub fn query_notifications(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<NotificationRecord>> {
        self.state_machine.query_notifications(id, since_id)
    }

    pub async fn query_summary(&self, filter: &QueryFilter) -> Result<QuerySummary> {
        self.state_machine.query_summary(filter).await
    }

    /// Topology for discovery.
    ///
    /// The first call waits for a fetch; concurrent first callers share it. Later calls return
    /// the cached snapshot right away and, if it is stale, schedule a refresh in the background;
    /// callers can check staleness with [`TopologySnapshot::is_stale`].
    pub async fn query_topology(&self) -> Result<TopologySnapshot> {
        if let Some(snapshot) = self.topology.current() {
            if self.topology.is_stale() {
                if let Err(e) = self.scheduler.submit(self.topology_refresh()) {
                    log::warn!("Could not schedule topology refresh: {}", e);
                }
            }
            return Ok(snapshot);
        }

        let handle = self.scheduler.submit(self.topology_refresh())?;
        match handle.wait().await {
            JobStatus::Completed => self.topology.current().ok_or_else(|| Error::TopologyUnavailable("refresh produced no snapshot".into())),
            JobStatus::Failed(reason) => Err(Error::TopologyUnavailable(reason)),
            other => Err(Error::TopologyUnavailable(format!("refresh ended as {:?}", other))),
        }
    }

    /// Non-forced, so a job finding a snapshot fetched while it waited reuses it.
    fn topology_refresh(&self) -> JobRequest {
        JobRequest::new(JobKind::TopologyRefresh { force: false }).with_timeout(self.backend_call_timeout)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.state_machine.subscribe()
    }

    /// Ids of all non-terminal reservations.
    pub fn active_reservations(&self) -> Vec<ConnectionId> {
        self.active.active_ids()
    }

    /// Every reservation, for persisting and a later `start_with_records`.
    pub async fn records(&self) -> Result<Vec<Reservation>> {
        self.state_machine.store().snapshots().await
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub async fn shutdown(self) {
        for handle in &self.periodic_jobs {
            self.scheduler.cancel(handle);
        }
        self.scheduler.shutdown().await;
        if let Some(audit) = &self.audit {
            audit.shutdown();
        }
        log::info!("Provider agent stopped.");
    }
}
