use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::provider::reservation::criteria::Criteria;
use crate::domain::provider::reservation::transition::ReservationEvent;
use crate::domain::provider::utils::id::{BackendHandle, ConnectionId};

/// Lifecycle state of a reservation.
///
/// `Failed`, `Expired` and `Terminated` are terminal for backend work: no further
/// backend call is ever issued on behalf of a reservation in one of them.
/// `Failed` and `Expired` can still be terminated by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    /// Record exists, the Reserve transition was not applied yet.
    Created,

    /// Resources are held, waiting for a ReserveCommit before `reserve_deadline`.
    Reserved,

    /// The requester committed the reservation.
    Committed,

    /// A backend `provision` call is in flight.
    Provisioning,

    /// The backend confirmed the data plane is set up.
    Provisioned,

    /// A backend `release` call is in flight.
    Releasing,

    /// The data plane was torn down, resources are still held.
    Released,

    /// End of life, requested by the requester.
    Terminated,

    /// A backend call failed permanently (or exhausted its retries).
    Failed,

    /// No ReserveCommit arrived before the reserve deadline.
    Expired,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Terminated | ReservationState::Failed | ReservationState::Expired)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One accepted transition, kept on the reservation for operator visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: ReservationState,
    pub to: ReservationState,
    pub event: ReservationEvent,
    pub version: u64,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ConnectionId,
    pub state: ReservationState,
    pub criteria: Criteria,

    /// Incremented on every accepted transition, starts at 0 in `Created`.
    pub version: u64,

    /// Absolute time (ms) after which an uncommitted reservation expires.
    pub reserve_deadline: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,

    /// Set when the backend confirmed `reserve`.
    pub backend_handle: Option<BackendHandle>,

    /// True once the reservation passed through `Committed`, i.e. the backend holds resources
    /// that a terminate has to give back.
    pub allocated: bool,

    /// Observational health flag maintained by the health monitor.
    pub degraded: bool,
    pub last_error: Option<String>,

    pub global_reservation_id: Option<String>,
    pub description: Option<String>,

    pub transitions: Vec<TransitionRecord>,
}

impl Reservation {
    pub fn new(
        id: ConnectionId,
        criteria: Criteria,
        now: i64,
        global_reservation_id: Option<String>,
        description: Option<String>,
    ) -> Self {
        Reservation {
            id,
            state: ReservationState::Created,
            criteria,
            version: 0,
            reserve_deadline: None,
            created_at: now,
            updated_at: now,
            backend_handle: None,
            allocated: false,
            degraded: false,
            last_error: None,
            global_reservation_id,
            description,
            transitions: Vec::new(),
        }
    }

    /// Moves the reservation to `to`, bumps the version and records the transition.
    pub fn apply(&mut self, event: ReservationEvent, to: ReservationState, now: i64) {
        let from = self.state;
        self.state = to;
        self.version += 1;
        self.updated_at = now;

        if to == ReservationState::Committed {
            self.allocated = true;
        }

        self.transitions.push(TransitionRecord { from, to, event, version: self.version, at: now });
    }

    /// Whether the reservation is past its reserve deadline at `now`.
    pub fn is_past_deadline(&self, now: i64) -> bool {
        self.state == ReservationState::Reserved && self.reserve_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn states_visited(&self) -> Vec<ReservationState> {
        let mut states = vec![ReservationState::Created];
        states.extend(self.transitions.iter().map(|t| t.to));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation() -> Reservation {
        Reservation::new(ConnectionId::new("c-1"), Criteria::new("a", "b", 10, 100), 1_000, None, None)
    }

    #[test]
    fn test_apply_bumps_version_and_records() {
        let mut res = reservation();
        res.apply(ReservationEvent::Reserve, ReservationState::Reserved, 2_000);
        res.apply(ReservationEvent::ReserveCommit, ReservationState::Committed, 3_000);

        assert_eq!(res.version, 2);
        assert_eq!(res.updated_at, 3_000);
        assert!(res.allocated);
        assert_eq!(
            res.states_visited(),
            vec![ReservationState::Created, ReservationState::Reserved, ReservationState::Committed]
        );
    }

    #[test]
    fn test_deadline_only_applies_to_reserved() {
        let mut res = reservation();
        res.reserve_deadline = Some(5_000);
        assert!(!res.is_past_deadline(6_000));

        res.apply(ReservationEvent::Reserve, ReservationState::Reserved, 2_000);
        assert!(!res.is_past_deadline(4_999));
        assert!(res.is_past_deadline(5_000));
    }
}
