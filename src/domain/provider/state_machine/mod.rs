pub mod job_dispatcher;
pub mod reservation_state_machine;
