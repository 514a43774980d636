use async_trait::async_trait;

use crate::domain::provider::backend::null_backend::NullBackend;
use crate::domain::provider::backend::nrm_backend_trait::{BackendHealth, NrmBackend, TopologyData};
use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};
use crate::error::{Error, Result};
use crate::loader::parser::parse_json_file;

/// Like [`NullBackend`], but serves the topology from a JSON file.
///
/// The file is read again on every `topology()` call so edits show up on the next refresh.
/// Health is only known for the backend as a whole.
#[derive(Debug)]
pub struct StaticTopologyBackend {
    topology_file: String,
    inner: NullBackend,
}

impl StaticTopologyBackend {
    pub fn new(topology_file: impl Into<String>) -> Self {
        StaticTopologyBackend { topology_file: topology_file.into(), inner: NullBackend::new() }
    }
}

#[async_trait]
impl NrmBackend for StaticTopologyBackend {
    fn name(&self) -> &str {
        "staticTopology"
    }

    async fn reserve(&self, id: &ConnectionId, criteria: &Criteria) -> Result<BackendHandle> {
        self.inner.reserve(id, criteria).await
    }

    async fn commit(&self, handle: &BackendHandle) -> Result<()> {
        self.inner.commit(handle).await
    }

    async fn provision(&self, handle: &BackendHandle) -> Result<()> {
        self.inner.provision(handle).await
    }

    async fn release(&self, handle: &BackendHandle) -> Result<()> {
        self.inner.release(handle).await
    }

    async fn terminate(&self, handle: &BackendHandle) -> Result<()> {
        self.inner.terminate(handle).await
    }

    async fn topology(&self) -> Result<TopologyData> {
        let path = self.topology_file.clone();
        let value = tokio::task::spawn_blocking(move || parse_json_file::<serde_json::Value>(&path))
            .await
            .map_err(|e| Error::IoError(std::io::Error::other(e)))??;
        Ok(TopologyData(value))
    }

    async fn health(&self, _handle: Option<&BackendHandle>) -> Result<BackendHealth> {
        Ok(BackendHealth::Healthy)
    }

    fn supports_connection_health(&self) -> bool {
        false
    }
}
