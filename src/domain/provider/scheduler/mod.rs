pub mod job;
pub mod job_scheduler;
pub mod retry_policy;
