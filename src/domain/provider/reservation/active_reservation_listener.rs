use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::domain::provider::reservation::reservation::ReservationState;
use crate::domain::provider::reservation::reservation_store::StateChangeListener;
use crate::domain::provider::utils::id::ConnectionId;

/// Keeps the set of non-terminal reservations in sync with the store.
///
/// The health monitor reads this set instead of scanning the whole store.
#[derive(Debug, Clone)]
pub struct ActiveReservationListener {
    active: Arc<RwLock<HashSet<ConnectionId>>>,
}

impl ActiveReservationListener {
    pub fn new() -> Self {
        Self { active: Arc::new(RwLock::new(HashSet::new())) }
    }

    pub fn active_ids(&self) -> Vec<ConnectionId> {
        match self.active.read() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn is_active(&self, id: &ConnectionId) -> bool {
        match self.active.read() {
            Ok(guard) => guard.contains(id),
            Err(poisoned) => poisoned.into_inner().contains(id),
        }
    }
}

impl Default for ActiveReservationListener {
    fn default() -> Self {
        Self::new()
    }
}

impl StateChangeListener for ActiveReservationListener {
    fn on_reservation_change(&self, id: &ConnectionId, new_state: ReservationState) {
        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match new_state {
            ReservationState::Created => {}
            ReservationState::Terminated | ReservationState::Failed | ReservationState::Expired => {
                if guard.remove(id) {
                    log::debug!("Reservation {} left the active set ({}).", id, new_state);
                }
            }
            _ => {
                guard.insert(id.clone());
            }
        }
    }
}
