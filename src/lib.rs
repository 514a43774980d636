use crate::api::provider_config_dto::ProviderConfigDto;
use crate::domain::provider::provider_config::ProviderConfig;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

/// Reads and validates the provider configuration at `file_path`.
pub fn load_provider_config(file_path: &str) -> Result<ProviderConfig> {
    let dto: ProviderConfigDto = parse_json_file::<ProviderConfigDto>(file_path)?;
    log::debug!("Configuration file '{}' parsed.", file_path);

    ProviderConfig::try_from(dto)
}
