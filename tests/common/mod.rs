#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nsi_provider_agent::domain::provider::backend::nrm_backend_trait::{BackendHealth, BackendOperation, NrmBackend, TopologyData};
use nsi_provider_agent::domain::provider::provider_agent::ProviderAgent;
use nsi_provider_agent::domain::provider::provider_config::{ProviderConfig, SchedulerConfig};
use nsi_provider_agent::domain::provider::reservation::criteria::Criteria;
use nsi_provider_agent::domain::provider::reservation::reservation::{Reservation, ReservationState};
use nsi_provider_agent::domain::provider::scheduler::retry_policy::RetryPolicy;
use nsi_provider_agent::domain::provider::utils::id::{BackendHandle, ConnectionId};
use nsi_provider_agent::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    remaining: u32,
    transient: bool,
}

/// Programmable NRM backend: counts calls, injects failures and latency.
#[derive(Debug, Default)]
pub struct MockBackend {
    calls: Mutex<HashMap<BackendOperation, usize>>,
    failures: Mutex<HashMap<BackendOperation, FailurePlan>>,
    latency: Mutex<HashMap<BackendOperation, Duration>>,
    topology_calls: AtomicUsize,
    topology_failing: AtomicBool,
    topology_latency: Mutex<Duration>,
    health_calls: AtomicUsize,
    health_latency: Mutex<Duration>,
    health: Mutex<Option<BackendHealth>>,
    health_failing: AtomicBool,
    aggregate_health_only: bool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(MockBackend::default())
    }

    pub fn with_aggregate_health() -> Arc<Self> {
        Arc::new(MockBackend { aggregate_health_only: true, ..Default::default() })
    }

    /// The next `times` calls of `operation` fail.
    pub fn fail(&self, operation: BackendOperation, times: u32, transient: bool) {
        self.failures.lock().unwrap().insert(operation, FailurePlan { remaining: times, transient });
    }

    pub fn set_latency(&self, operation: BackendOperation, latency: Duration) {
        self.latency.lock().unwrap().insert(operation, latency);
    }

    pub fn calls(&self, operation: BackendOperation) -> usize {
        self.calls.lock().unwrap().get(&operation).copied().unwrap_or(0)
    }

    pub fn topology_calls(&self) -> usize {
        self.topology_calls.load(Ordering::SeqCst)
    }

    pub fn set_topology_failing(&self, failing: bool) {
        self.topology_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_topology_latency(&self, latency: Duration) {
        *self.topology_latency.lock().unwrap() = latency;
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn set_health_latency(&self, latency: Duration) {
        *self.health_latency.lock().unwrap() = latency;
    }

    pub fn set_health(&self, health: BackendHealth) {
        *self.health.lock().unwrap() = Some(health);
    }

    pub fn set_health_failing(&self, failing: bool) {
        self.health_failing.store(failing, Ordering::SeqCst);
    }

    async fn call(&self, operation: BackendOperation) -> Result<()> {
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;

        let latency = self.latency.lock().unwrap().get(&operation).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut failures = self.failures.lock().unwrap();
        if let Some(plan) = failures.get_mut(&operation) {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                return Err(Error::backend(operation, "injected failure", plan.transient));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NrmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn reserve(&self, _id: &ConnectionId, _criteria: &Criteria) -> Result<BackendHandle> {
        self.call(BackendOperation::Reserve).await?;
        Ok(BackendHandle::generate())
    }

    async fn commit(&self, _handle: &BackendHandle) -> Result<()> {
        self.call(BackendOperation::Commit).await
    }

    async fn provision(&self, _handle: &BackendHandle) -> Result<()> {
        self.call(BackendOperation::Provision).await
    }

    async fn release(&self, _handle: &BackendHandle) -> Result<()> {
        self.call(BackendOperation::Release).await
    }

    async fn terminate(&self, _handle: &BackendHandle) -> Result<()> {
        self.call(BackendOperation::Terminate).await
    }

    async fn topology(&self) -> Result<TopologyData> {
        let call = self.topology_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = *self.topology_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.topology_failing.load(Ordering::SeqCst) {
            return Err(Error::backend(BackendOperation::Reserve, "topology service unavailable", true));
        }
        Ok(TopologyData(serde_json::json!({ "fetch": call })))
    }

    async fn health(&self, _handle: Option<&BackendHandle>) -> Result<BackendHealth> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.health_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.health_failing.load(Ordering::SeqCst) {
            return Err(Error::backend(BackendOperation::Provision, "health probe failed", true));
        }
        Ok(self.health.lock().unwrap().unwrap_or(BackendHealth::Healthy))
    }

    fn supports_connection_health(&self) -> bool {
        !self.aggregate_health_only
    }
}

/// Fast timers, no periodic jobs, three attempts per backend call without backoff.
pub fn test_config() -> ProviderConfig {
    ProviderConfig {
        reserve_timeout: Duration::from_secs(120),
        scheduler: SchedulerConfig { worker_count: 4, queue_capacity: 64, timer_resolution: Duration::from_millis(5) },
        backend_call_timeout: Duration::from_secs(2),
        backend_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        },
        submit_retry_attempts: 3,
        topology_freshness: Duration::from_secs(60),
        health_check_interval: None,
        health_check_via_topology: false,
        health_failure_threshold: 3,
        timeout_sweep_interval: None,
        ..ProviderConfig::default()
    }
}

pub fn criteria() -> Criteria {
    Criteria::new("urn:ogf:network:example.net:2025:port-1", "urn:ogf:network:example.net:2025:port-2", 1000, 100)
}

/// Polls until `check` holds for the reservation, panics after 5 seconds.
pub async fn wait_for<F>(agent: &ProviderAgent, id: &ConnectionId, check: F) -> Reservation
where
    F: Fn(&Reservation) -> bool,
{
    for _ in 0..500 {
        let reservation = agent.query_state(id).await.unwrap();
        if check(&reservation) {
            return reservation;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let reservation = agent.query_state(id).await.unwrap();
    panic!("condition not reached for {}: {:?}", id, reservation);
}

pub async fn wait_for_state(agent: &ProviderAgent, id: &ConnectionId, state: ReservationState) -> Reservation {
    wait_for(agent, id, |reservation| reservation.state == state).await
}

/// Polls `check` until it holds, panics after 5 seconds.
pub async fn eventually<F>(description: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}
