use std::time::Duration;

use crate::api::provider_config_dto::{BackendDto, ProviderConfigDto};
use crate::domain::provider::scheduler::retry_policy::RetryPolicy;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Longest the timer sleeps before re-reading the clock.
    pub timer_resolution: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { worker_count: 4, queue_capacity: 256, timer_resolution: Duration::from_millis(100) }
    }
}

/// Validated provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub reserve_timeout: Duration,
    pub scheduler: SchedulerConfig,
    pub backend_call_timeout: Duration,
    pub backend_retry: RetryPolicy,
    /// How often a submission rejected with `CapacityExceeded` is tried again.
    pub submit_retry_attempts: u32,
    pub topology_freshness: Duration,
    /// `None` disables periodic health checks.
    pub health_check_interval: Option<Duration>,
    pub health_check_via_topology: bool,
    pub health_failure_threshold: u32,
    /// `None` disables the periodic global timeout sweep.
    pub timeout_sweep_interval: Option<Duration>,
    pub audit_file: Option<String>,
    pub log_level: String,
    pub backend: BackendDto,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::from_validated(ProviderConfigDto::default())
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl TryFrom<ProviderConfigDto> for ProviderConfig {
    type Error = Error;

    fn try_from(dto: ProviderConfigDto) -> Result<Self, Self::Error> {
        if dto.reserve_timeout == 0 {
            return Err(Error::ConfigurationError("reserveTimeout must be greater than 0".to_string()));
        }
        if dto.scheduler.worker_count == 0 {
            return Err(Error::ConfigurationError("scheduler.workerCount must be greater than 0".to_string()));
        }
        if dto.scheduler.queue_capacity == 0 {
            return Err(Error::ConfigurationError("scheduler.queueCapacity must be greater than 0".to_string()));
        }
        if dto.backend_retry.max_attempts == 0 {
            return Err(Error::ConfigurationError("backendRetry.maxAttempts must be at least 1".to_string()));
        }
        if dto.backend_retry.multiplier < 1.0 {
            return Err(Error::ConfigurationError(format!(
                "backendRetry.multiplier must be >= 1.0, got {}",
                dto.backend_retry.multiplier
            )));
        }
        if dto.health_failure_threshold == 0 {
            return Err(Error::ConfigurationError("healthFailureThreshold must be greater than 0".to_string()));
        }
        if dto.backend.typ == "staticTopology" && dto.backend.topology_file.is_none() {
            return Err(Error::ConfigurationError("backend 'staticTopology' requires 'topologyFile'".to_string()));
        }

        Ok(ProviderConfig::from_validated(dto))
    }
}

impl ProviderConfig {
    fn from_validated(dto: ProviderConfigDto) -> Self {
        ProviderConfig {
            reserve_timeout: Duration::from_secs(dto.reserve_timeout),
            scheduler: SchedulerConfig {
                worker_count: dto.scheduler.worker_count,
                queue_capacity: dto.scheduler.queue_capacity,
                timer_resolution: Duration::from_millis(dto.scheduler.timer_resolution_ms.max(1)),
            },
            backend_call_timeout: Duration::from_secs(dto.backend_call_timeout.max(1)),
            backend_retry: RetryPolicy {
                max_attempts: dto.backend_retry.max_attempts,
                initial_backoff: Duration::from_millis(dto.backend_retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(dto.backend_retry.max_backoff_ms),
                multiplier: dto.backend_retry.multiplier,
            },
            submit_retry_attempts: dto.submit_retry_attempts,
            topology_freshness: Duration::from_secs(dto.topology_freshness),
            health_check_interval: non_zero_secs(dto.backend_health_check_interval),
            health_check_via_topology: dto.health_check_via_topology,
            health_failure_threshold: dto.health_failure_threshold,
            timeout_sweep_interval: non_zero_secs(dto.timeout_sweep_interval),
            audit_file: dto.audit_file,
            log_level: dto.logging.level,
            backend: dto.backend,
        }
    }
}
