use std::str::FromStr;
use std::sync::Arc;

use crate::api::provider_config_dto::BackendDto;
use crate::domain::provider::backend::null_backend::NullBackend;
use crate::domain::provider::backend::nrm_backend_trait::NrmBackend;
use crate::domain::provider::backend::static_topology_backend::StaticTopologyBackend;
use crate::error::{Error, Result};

/// Backend variants that can be selected from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Null,
    StaticTopology,
}

impl BackendType {
    pub fn get_instance(dto: &BackendDto) -> Result<Arc<dyn NrmBackend>> {
        let backend_type = BackendType::from_str(&dto.typ)?;

        match backend_type {
            BackendType::Null => Ok(Arc::new(NullBackend::new())),
            BackendType::StaticTopology => {
                let file = dto.topology_file.clone().ok_or_else(|| {
                    Error::ConfigurationError("backend 'staticTopology' requires 'topologyFile'".to_string())
                })?;
                Ok(Arc::new(StaticTopologyBackend::new(file)))
            }
        }
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(backend_type_dto: &str) -> Result<BackendType> {
        match backend_type_dto {
            "null" => Ok(BackendType::Null),
            "staticTopology" => Ok(BackendType::StaticTopology),
            _ => Err(Error::UnknownBackendType(backend_type_dto.to_string())),
        }
    }
}
