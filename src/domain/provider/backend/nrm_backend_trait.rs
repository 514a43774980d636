use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};
use crate::error::Result;

/// Backend operations issued on behalf of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendOperation {
    Reserve,
    Commit,
    Provision,
    Release,
    Terminate,
}

/// Opaque topology document supplied by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyData(pub serde_json::Value);

impl TopologyData {
    pub fn empty() -> Self {
        TopologyData(serde_json::Value::Array(Vec::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendHealth {
    Healthy,
    Degraded,
}

/// Capability surface of a Network Resource Manager.
///
/// Implementations are untrusted I/O: any call may fail or hang. The core only calls
/// them from scheduler workers, wrapped in a per-call timeout.
#[async_trait]
pub trait NrmBackend: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    async fn reserve(&self, id: &ConnectionId, criteria: &Criteria) -> Result<BackendHandle>;

    async fn commit(&self, handle: &BackendHandle) -> Result<()>;

    async fn provision(&self, handle: &BackendHandle) -> Result<()>;

    async fn release(&self, handle: &BackendHandle) -> Result<()>;

    async fn terminate(&self, handle: &BackendHandle) -> Result<()>;

    async fn topology(&self) -> Result<TopologyData>;

    /// Health of a single connection, or of the backend as a whole for `None`.
    async fn health(&self, handle: Option<&BackendHandle>) -> Result<BackendHealth>;

    /// `false` if `health` only answers for `None` (aggregate health).
    fn supports_connection_health(&self) -> bool {
        true
    }
}
