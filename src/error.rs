use thiserror::Error;

use crate::domain::provider::backend::nrm_backend_trait::BackendOperation;
use crate::domain::provider::reservation::reservation::ReservationState;
use crate::domain::provider::reservation::transition::ReservationEvent;
use crate::domain::provider::utils::id::{ConnectionId, JobId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON document: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Failed to write audit trail: {0}")]
    AuditError(#[from] csv::Error),

    #[error("Invalid provider configuration: {0}")]
    ConfigurationError(String),

    #[error("Unknown backend type: {0}")]
    UnknownBackendType(String),

    #[error("Invalid reservation criteria: {0}")]
    InvalidCriteria(String),

    #[error("Reservation {0} not found")]
    ReservationNotFound(ConnectionId),

    #[error("Reservation {0} already exists")]
    DuplicateReservation(ConnectionId),

    #[error("Event {event:?} is not allowed for reservation {id} in state {state:?}")]
    InvalidTransition { id: ConnectionId, event: ReservationEvent, state: ReservationState },

    #[error("Timeout for reservation {id}: {reason}")]
    Timeout { id: ConnectionId, reason: String },

    #[error("Backend {operation:?} failed: {reason} (transient: {transient})")]
    BackendFailure { operation: BackendOperation, reason: String, transient: bool },

    #[error("Job queue is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("Reservation {id} changed concurrently: expected version {expected}, found {actual}")]
    StaleVersion { id: ConnectionId, expected: u64, actual: u64 },

    #[error("No topology available: {0}")]
    TopologyUnavailable(String),

    #[error("Job {job} missed its deadline")]
    DeadlineExceeded { job: JobId },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Provider agent is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn backend(operation: BackendOperation, reason: impl Into<String>, transient: bool) -> Self {
        Error::BackendFailure { operation, reason: reason.into(), transient }
    }

    /// Whether a job failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BackendFailure { transient, .. } => *transient,
            Error::Timeout { .. } | Error::CapacityExceeded { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
