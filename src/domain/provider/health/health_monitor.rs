use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::provider::backend::nrm_backend_trait::{BackendHealth, NrmBackend};
use crate::domain::provider::reservation::active_reservation_listener::ActiveReservationListener;
use crate::domain::provider::reservation::reservation_store::ReservationStore;
use crate::domain::provider::topology::topology_cache::TopologyCache;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};

/// Result of one health probe for one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub connection_id: ConnectionId,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Degraded,
    Restored,
}

#[derive(Debug, Default)]
struct HealthState {
    consecutive_failures: HashMap<ConnectionId, u32>,
    degraded: HashSet<ConnectionId>,
}

/// Polls backend health for active reservations and counts consecutive failures.
///
/// Degradation is observational: the monitor reports changes, it never moves a
/// reservation to another state.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    backend: Arc<dyn NrmBackend>,
    topology: TopologyCache,
    store: ReservationStore,
    active: ActiveReservationListener,
    via_topology: bool,
    failure_threshold: u32,
    /// Upper bound for a single probe. A probe that does not answer in time counts as a failure.
    call_timeout: Duration,
    state: Arc<Mutex<HealthState>>,
}

impl HealthMonitor {
    pub fn new(
        backend: Arc<dyn NrmBackend>,
        topology: TopologyCache,
        store: ReservationStore,
        active: ActiveReservationListener,
        via_topology: bool,
        failure_threshold: u32,
        call_timeout: Duration,
    ) -> Self {
        HealthMonitor {
            backend,
            topology,
            store,
            active,
            via_topology,
            failure_threshold,
            call_timeout,
            state: Arc::new(Mutex::new(HealthState::default())),
        }
    }

    /// Non-terminal reservations that hold a backend handle.
    async fn active_connections(&self) -> Vec<(ConnectionId, BackendHandle)> {
        let mut connections = Vec::new();
        for id in self.active.active_ids() {
            match self.store.snapshot(&id).await {
                Ok(reservation) if !reservation.state.is_terminal() => {
                    if let Some(handle) = reservation.backend_handle {
                        connections.push((id, handle));
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!("Skipping health check for {}: {}", id, e),
            }
        }
        connections
    }

    /// Runs one round of health checks. Backend errors and probes exceeding the call timeout
    /// count as unhealthy. Per-connection probes run concurrently.
    pub async fn check(&self) -> Vec<HealthReport> {
        let connections = self.active_connections().await;

        if self.via_topology {
            let (healthy, detail) = match tokio::time::timeout(self.call_timeout, self.topology.refresh(true)).await {
                Ok(Ok(_)) => (true, None),
                Ok(Err(e)) => (false, Some(format!("topology unavailable: {}", e))),
                Err(_) => (false, Some(format!("topology unavailable: no answer within {:?}", self.call_timeout))),
            };
            return aggregate(connections, healthy, detail);
        }

        if !self.backend.supports_connection_health() {
            let (healthy, detail) = self.probe(None).await;
            return aggregate(connections, healthy, detail);
        }

        let probes = connections.iter().map(|(_, handle)| self.probe(Some(handle)));
        let results = join_all(probes).await;

        connections
            .into_iter()
            .zip(results)
            .map(|((id, _), (healthy, detail))| HealthReport { connection_id: id, healthy, detail })
            .collect()
    }

    async fn probe(&self, handle: Option<&BackendHandle>) -> (bool, Option<String>) {
        match tokio::time::timeout(self.call_timeout, self.backend.health(handle)).await {
            Ok(Ok(BackendHealth::Healthy)) => (true, None),
            Ok(Ok(BackendHealth::Degraded)) => (false, Some("backend reports degraded".to_string())),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some(format!("health probe timed out after {:?}", self.call_timeout))),
        }
    }

    /// Updates the failure counters and returns the reservations whose degraded flag flips.
    pub fn record(&self, reports: &[HealthReport]) -> Vec<(ConnectionId, HealthChange)> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut changes = Vec::new();

        for report in reports {
            let id = &report.connection_id;
            if report.healthy {
                state.consecutive_failures.remove(id);
                if state.degraded.remove(id) {
                    changes.push((id.clone(), HealthChange::Restored));
                }
                continue;
            }

            let failures = state.consecutive_failures.entry(id.clone()).or_insert(0);
            *failures += 1;
            let failures = *failures;
            if failures >= self.failure_threshold && state.degraded.insert(id.clone()) {
                tracing::warn!(connection_id = %id, failures, detail = ?report.detail, "Reservation degraded");
                changes.push((id.clone(), HealthChange::Degraded));
            }
        }

        let active: HashSet<ConnectionId> = self.active.active_ids().into_iter().collect();
        state.consecutive_failures.retain(|id, _| active.contains(id));
        state.degraded.retain(|id| active.contains(id));

        changes
    }
}

fn aggregate(connections: Vec<(ConnectionId, BackendHandle)>, healthy: bool, detail: Option<String>) -> Vec<HealthReport> {
    connections
        .into_iter()
        .map(|(id, _)| HealthReport { connection_id: id, healthy, detail: detail.clone() })
        .collect()
}
