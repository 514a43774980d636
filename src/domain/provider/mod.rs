pub mod backend;
pub mod health;
pub mod provider_agent;
pub mod provider_config;
pub mod reservation;
pub mod scheduler;
pub mod state_machine;
pub mod topology;
pub mod utils;
