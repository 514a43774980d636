use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::clock::clock::{SharedClock, duration_to_ms};
use crate::domain::provider::backend::nrm_backend_trait::{NrmBackend, TopologyData};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub data: TopologyData,
    pub fetched_at: i64,
    /// Incremented on every successful refresh, starts at 1.
    pub version: u64,
}

impl TopologySnapshot {
    pub fn age(&self, now: i64) -> i64 {
        now - self.fetched_at
    }

    /// A snapshot is fresh for exactly `freshness`, so a periodic refresh at that interval fetches.
    pub fn is_stale(&self, now: i64, freshness: Duration) -> bool {
        self.age(now) >= duration_to_ms(freshness)
    }
}

/// Last topology fetched from the backend.
///
/// Readers never wait for a refresh. At most one backend `topology()` call is in flight:
/// callers that find a refresh running wait for it and then reuse its snapshot.
#[derive(Debug, Clone)]
pub struct TopologyCache {
    backend: Arc<dyn NrmBackend>,
    clock: SharedClock,
    freshness: Duration,
    snapshot: Arc<RwLock<Option<TopologySnapshot>>>,
    refresh_gate: Arc<Mutex<()>>,
}

impl TopologyCache {
    pub fn new(backend: Arc<dyn NrmBackend>, clock: SharedClock, freshness: Duration) -> Self {
        TopologyCache {
            backend,
            clock,
            freshness,
            snapshot: Arc::new(RwLock::new(None)),
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Current snapshot without touching the backend, possibly stale.
    pub fn current(&self) -> Option<TopologySnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_stale(&self) -> bool {
        let now = self.clock.get_current_time_in_ms();
        self.current().is_none_or(|snapshot| snapshot.is_stale(now, self.freshness))
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Cached snapshot, fetched synchronously on first use or when `force` is set.
    pub async fn get(&self, force: bool) -> Result<TopologySnapshot> {
        if !force {
            if let Some(snapshot) = self.current() {
                return Ok(snapshot);
            }
        }
        self.refresh(force).await
    }

    pub async fn refresh_if_stale(&self) -> Result<TopologySnapshot> {
        self.refresh(false).await
    }

    /// Single-flight refresh. Without `force` a snapshot that became fresh while waiting
    /// for the gate is returned as is. A failed fetch keeps the previous snapshot.
    pub async fn refresh(&self, force: bool) -> Result<TopologySnapshot> {
        let observed_version = self.current().map(|snapshot| snapshot.version);
        let _gate = self.refresh_gate.lock().await;

        if let Some(snapshot) = self.current() {
            let refreshed_meanwhile = observed_version != Some(snapshot.version);
            if refreshed_meanwhile || (!force && !snapshot.is_stale(self.clock.get_current_time_in_ms(), self.freshness)) {
                return Ok(snapshot);
            }
        }

        log::debug!("Fetching topology from backend '{}'.", self.backend.name());
        let data = match self.backend.topology().await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Topology refresh failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };

        let mut guard = self.snapshot.write().map_err(|_| Error::LockPoisoned("topology cache"))?;
        let version = guard.as_ref().map(|snapshot| snapshot.version + 1).unwrap_or(1);
        let snapshot = TopologySnapshot { data, fetched_at: self.clock.get_current_time_in_ms(), version };
        *guard = Some(snapshot.clone());

        tracing::info!(version = snapshot.version, fetched_at = snapshot.fetched_at, "Topology refreshed");
        Ok(snapshot)
    }
}
