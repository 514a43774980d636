use serde::Serialize;

use crate::domain::provider::reservation::reservation::Reservation;
use crate::domain::provider::utils::id::ConnectionId;

/// Selects reservations for a summary query. Empty id lists select every reservation.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub connection_ids: Vec<ConnectionId>,
    pub global_reservation_ids: Vec<String>,
    /// Only reservations modified after this time (ms).
    pub if_modified_since: Option<i64>,
}

impl QueryFilter {
    pub fn matches(&self, reservation: &Reservation) -> bool {
        let selected = (self.connection_ids.is_empty() && self.global_reservation_ids.is_empty())
            || self.connection_ids.contains(&reservation.id)
            || reservation
                .global_reservation_id
                .as_ref()
                .is_some_and(|global_id| self.global_reservation_ids.contains(global_id));

        selected && self.if_modified_since.is_none_or(|since| reservation.updated_at > since)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSummary {
    pub reservation: Reservation,
    pub last_result_id: Option<u64>,
    pub last_notification_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub reservations: Vec<ReservationSummary>,
    /// Latest `updated_at` over the returned reservations.
    pub last_modified: Option<i64>,
}
