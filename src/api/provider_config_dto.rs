use serde::{Deserialize, Serialize};

/// Root of the provider configuration file. Every field has a default.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfigDto {
    /// Seconds an uncommitted reservation is held.
    pub reserve_timeout: u64,
    pub scheduler: SchedulerDto,
    /// Seconds a single backend call may take.
    pub backend_call_timeout: u64,
    pub backend_retry: RetryDto,
    pub submit_retry_attempts: u32,
    /// Seconds a topology snapshot is considered fresh.
    pub topology_freshness: u64,
    /// Seconds between health checks, 0 disables them.
    pub backend_health_check_interval: u64,
    pub health_check_via_topology: bool,
    pub health_failure_threshold: u32,
    /// Seconds between global timeout sweeps, 0 disables them.
    pub timeout_sweep_interval: u64,
    pub audit_file: Option<String>,
    pub logging: LoggingDto,
    pub backend: BackendDto,
}

impl Default for ProviderConfigDto {
    fn default() -> Self {
        ProviderConfigDto {
            reserve_timeout: 120,
            scheduler: SchedulerDto::default(),
            backend_call_timeout: 30,
            backend_retry: RetryDto::default(),
            submit_retry_attempts: 3,
            topology_freshness: 60,
            backend_health_check_interval: 60,
            health_check_via_topology: false,
            health_failure_threshold: 3,
            timeout_sweep_interval: 30,
            audit_file: None,
            logging: LoggingDto::default(),
            backend: BackendDto::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerDto {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub timer_resolution_ms: u64,
}

impl Default for SchedulerDto {
    fn default() -> Self {
        SchedulerDto { worker_count: 4, queue_capacity: 256, timer_resolution_ms: 100 }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryDto {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryDto {
    fn default() -> Self {
        RetryDto { max_attempts: 1, initial_backoff_ms: 500, max_backoff_ms: 30_000, multiplier: 2.0 }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingDto {
    pub level: String,
}

impl Default for LoggingDto {
    fn default() -> Self {
        LoggingDto { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendDto {
    pub typ: String,
    pub topology_file: Option<String>,
}

impl Default for BackendDto {
    fn default() -> Self {
        BackendDto { typ: "null".to_string(), topology_file: None }
    }
}
