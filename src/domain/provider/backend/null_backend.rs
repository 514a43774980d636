use async_trait::async_trait;

use crate::domain::provider::backend::nrm_backend_trait::{BackendHealth, NrmBackend, TopologyData};
use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};
use crate::error::Result;

/// Backend without a network behind it. Every call succeeds.
#[derive(Debug, Default)]
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        NullBackend
    }
}

#[async_trait]
impl NrmBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn reserve(&self, id: &ConnectionId, criteria: &Criteria) -> Result<BackendHandle> {
        log::debug!("NullBackend reserve {} ({} -> {}, {} Mbit/s)", id, criteria.source_stp, criteria.destination_stp, criteria.bandwidth);
        Ok(BackendHandle::generate())
    }

    async fn commit(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    async fn provision(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    async fn release(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _handle: &BackendHandle) -> Result<()> {
        Ok(())
    }

    async fn topology(&self) -> Result<TopologyData> {
        Ok(TopologyData::empty())
    }

    async fn health(&self, _handle: Option<&BackendHandle>) -> Result<BackendHealth> {
        Ok(BackendHealth::Healthy)
    }
}
