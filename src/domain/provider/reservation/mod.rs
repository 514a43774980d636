pub mod active_reservation_listener;
pub mod criteria;
pub mod notification;
pub mod query;
pub mod reservation;
pub mod reservation_store;
pub mod transition;
