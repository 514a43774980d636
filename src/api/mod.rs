pub mod provider_config_dto;
