use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::provider::reservation::reservation::{Reservation, ReservationState};
use crate::domain::provider::utils::id::ConnectionId;
use crate::error::{Error, Result};

new_key_type! {
    pub struct ReservationKey;
}

/// Handle to a single reservation. Its write lock is the per-reservation serialization point.
pub type ReservationEntry = Arc<tokio::sync::RwLock<Reservation>>;

/// Observer for accepted state changes (the subscription side of the store).
///
/// Called while the reservation's write lock is held, so it must not wait on that entry.
pub trait StateChangeListener: std::fmt::Debug + Send + Sync {
    fn on_reservation_change(&self, id: &ConnectionId, new_state: ReservationState);
}

#[derive(Debug)]
struct StoreInner {
    /// Reservation Storage.
    slots: SlotMap<ReservationKey, ReservationEntry>,

    /// Index lookup of the internal key by connection id.
    id_index: HashMap<ConnectionId, ReservationKey>,
}

/// In-memory record of every reservation.
///
/// The outer lock only guards the maps and is never held across an await. Mutation of a
/// reservation goes through the state machine, which holds the entry's write lock for the
/// whole transition.
#[derive(Debug, Clone)]
pub struct ReservationStore {
    inner: Arc<RwLock<StoreInner>>,
    listeners: Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>,
}

impl ReservationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner { slots: SlotMap::with_key(), id_index: HashMap::new() })),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Adds a reservation, fails if its id is already known.
    pub fn insert(&self, reservation: Reservation) -> Result<ReservationEntry> {
        let mut guard = self.inner.write().map_err(|_| Error::LockPoisoned("reservation store"))?;
        if guard.id_index.contains_key(&reservation.id) {
            return Err(Error::DuplicateReservation(reservation.id));
        }

        let id = reservation.id.clone();
        let entry = Arc::new(tokio::sync::RwLock::new(reservation));
        let key = guard.slots.insert(entry.clone());
        guard.id_index.insert(id, key);

        Ok(entry)
    }

    pub fn remove(&self, id: &ConnectionId) -> Result<()> {
        let mut guard = self.inner.write().map_err(|_| Error::LockPoisoned("reservation store"))?;
        let key = guard.id_index.remove(id).ok_or_else(|| Error::ReservationNotFound(id.clone()))?;
        guard.slots.remove(key);
        Ok(())
    }

    pub fn entry(&self, id: &ConnectionId) -> Result<ReservationEntry> {
        let guard = self.inner.read().map_err(|_| Error::LockPoisoned("reservation store"))?;
        let key = guard.id_index.get(id).ok_or_else(|| Error::ReservationNotFound(id.clone()))?;
        guard.slots.get(*key).cloned().ok_or_else(|| Error::ReservationNotFound(id.clone()))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().map(|guard| guard.id_index.contains_key(id)).unwrap_or(false)
    }

    /// Copy of the reservation as of the last completed transition.
    pub async fn snapshot(&self, id: &ConnectionId) -> Result<Reservation> {
        let entry = self.entry(id)?;
        let reservation = entry.read().await;
        Ok(reservation.clone())
    }

    pub async fn snapshots(&self) -> Result<Vec<Reservation>> {
        let entries: Vec<ReservationEntry> = {
            let guard = self.inner.read().map_err(|_| Error::LockPoisoned("reservation store"))?;
            guard.slots.values().cloned().collect()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.read().await.clone());
        }
        Ok(snapshots)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads previously exported records. Listeners see every restored state.
    pub fn restore(&self, records: Vec<Reservation>) -> Result<usize> {
        let mut restored = 0;
        for reservation in records {
            let id = reservation.id.clone();
            let state = reservation.state;
            self.insert(reservation)?;
            self.notify(&id, state);
            restored += 1;
        }
        Ok(restored)
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn notify(&self, id: &ConnectionId, new_state: ReservationState) {
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener.on_reservation_change(id, new_state);
        }
    }
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}
