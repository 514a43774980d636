use serde::{Deserialize, Serialize};

use crate::domain::provider::backend::nrm_backend_trait::BackendOperation;
use crate::domain::provider::reservation::reservation::ReservationState;

/// Everything that can move a reservation along its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationEvent {
    Reserve,
    ReserveCommit,
    Provision,
    Release,
    Terminate,
    ReserveTimeout,
    BackendConfirmed(BackendOperation),
    BackendFailed(BackendOperation),
}

/// The transition graph. Returns `None` if `event` is not allowed in `state`.
///
/// Pure function, the state machine applies the result under the reservation's write lock.
pub fn next_state(state: ReservationState, event: ReservationEvent) -> Option<ReservationState> {
    use ReservationEvent as E;
    use ReservationState as S;

    match (state, event) {
        (S::Created, E::Reserve) => Some(S::Reserved),
        (S::Reserved, E::ReserveCommit) => Some(S::Committed),
        (S::Reserved, E::ReserveTimeout) => Some(S::Expired),
        (S::Committed, E::Provision) => Some(S::Provisioning),
        (S::Provisioning, E::BackendConfirmed(BackendOperation::Provision)) => Some(S::Provisioned),
        (S::Provisioning | S::Provisioned, E::Release) => Some(S::Releasing),
        (S::Releasing, E::BackendConfirmed(BackendOperation::Release)) => Some(S::Released),
        (S::Reserved | S::Committed | S::Released | S::Failed | S::Expired, E::Terminate) => Some(S::Terminated),
        (s, E::BackendFailed(_)) if !s.is_terminal() => Some(S::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReservationEvent as E;
    use ReservationState as S;

    const ALL_STATES: [S; 10] = [
        S::Created,
        S::Reserved,
        S::Committed,
        S::Provisioning,
        S::Provisioned,
        S::Releasing,
        S::Released,
        S::Terminated,
        S::Failed,
        S::Expired,
    ];

    #[test]
    fn test_happy_path() {
        let path = [
            (E::Reserve, S::Reserved),
            (E::ReserveCommit, S::Committed),
            (E::Provision, S::Provisioning),
            (E::BackendConfirmed(BackendOperation::Provision), S::Provisioned),
            (E::Release, S::Releasing),
            (E::BackendConfirmed(BackendOperation::Release), S::Released),
            (E::Terminate, S::Terminated),
        ];

        let mut state = S::Created;
        for (event, expected) in path {
            state = next_state(state, event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_expired_only_reachable_from_reserved() {
        for state in ALL_STATES {
            let next = next_state(state, E::ReserveTimeout);
            if state == S::Reserved {
                assert_eq!(next, Some(S::Expired));
            } else {
                assert_eq!(next, None, "timeout accepted in {:?}", state);
            }
        }
    }

    #[test]
    fn test_terminal_states_absorb_backend_failures() {
        for state in [S::Terminated, S::Failed, S::Expired] {
            assert_eq!(next_state(state, E::BackendFailed(BackendOperation::Terminate)), None);
        }
        assert_eq!(next_state(S::Releasing, E::BackendFailed(BackendOperation::Release)), Some(S::Failed));
        assert_eq!(next_state(S::Created, E::BackendFailed(BackendOperation::Reserve)), Some(S::Failed));
    }

    #[test]
    fn test_terminate_preconditions() {
        let allowed = [S::Reserved, S::Committed, S::Released, S::Failed, S::Expired];
        for state in ALL_STATES {
            assert_eq!(next_state(state, E::Terminate).is_some(), allowed.contains(&state), "{:?}", state);
        }
    }

    #[test]
    fn test_no_skipping_predecessors() {
        assert_eq!(next_state(S::Reserved, E::Provision), None);
        assert_eq!(next_state(S::Committed, E::Release), None);
        assert_eq!(next_state(S::Committed, E::BackendConfirmed(BackendOperation::Provision)), None);
        assert_eq!(next_state(S::Provisioned, E::BackendConfirmed(BackendOperation::Release)), None);
        assert_eq!(next_state(S::Committed, E::ReserveCommit), None);
    }
}
