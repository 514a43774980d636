use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::domain::provider::reservation::reservation::ReservationState;
use crate::domain::provider::utils::id::ConnectionId;
use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Terminal outcome of a requester operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    ReserveConfirmed,
    ReserveFailed,
    ReserveCommitConfirmed,
    ReserveCommitFailed,
    ProvisionConfirmed,
    ReleaseConfirmed,
    TerminateConfirmed,
    Error,
}

/// Unsolicited event raised by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    ReserveTimeout,
    ErrorEvent,
    HealthDegraded,
    HealthRestored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub result_id: u64,
    pub connection_id: ConnectionId,
    pub kind: ResultKind,
    pub at: i64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub notification_id: u64,
    pub connection_id: ConnectionId,
    pub kind: NotificationKind,
    pub at: i64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Result(ResultRecord),
    Notification(NotificationRecord),
}

/// What subscribers receive: the record plus the reservation state it was raised in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub connection_id: ConnectionId,
    pub outcome: EventOutcome,
    pub state: ReservationState,
    pub version: u64,
}

#[derive(Debug, Default)]
struct ConnectionLog {
    results: Vec<ResultRecord>,
    notifications: Vec<NotificationRecord>,
}

/// Per-reservation result and notification registry.
///
/// Ids are assigned per reservation and start at 1. Every appended record is also
/// broadcast to subscribers; a lagging subscriber loses events but the log keeps them.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    logs: Arc<RwLock<HashMap<ConnectionId, ConnectionLog>>>,
    sender: broadcast::Sender<ProviderEvent>,
}

impl NotificationLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        NotificationLog { logs: Arc::new(RwLock::new(HashMap::new())), sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.sender.subscribe()
    }

    pub fn add_result(
        &self,
        id: &ConnectionId,
        kind: ResultKind,
        detail: Option<String>,
        at: i64,
        state: ReservationState,
        version: u64,
    ) -> Result<u64> {
        let record = {
            let mut logs = self.logs.write().map_err(|_| Error::LockPoisoned("notification log"))?;
            let log = logs.entry(id.clone()).or_default();
            let record = ResultRecord {
                result_id: log.results.len() as u64 + 1,
                connection_id: id.clone(),
                kind,
                at,
                detail,
            };
            log.results.push(record.clone());
            record
        };

        let result_id = record.result_id;
        self.publish(id, EventOutcome::Result(record), state, version);
        Ok(result_id)
    }

    pub fn add_notification(
        &self,
        id: &ConnectionId,
        kind: NotificationKind,
        detail: Option<String>,
        at: i64,
        state: ReservationState,
        version: u64,
    ) -> Result<u64> {
        let record = {
            let mut logs = self.logs.write().map_err(|_| Error::LockPoisoned("notification log"))?;
            let log = logs.entry(id.clone()).or_default();
            let record = NotificationRecord {
                notification_id: log.notifications.len() as u64 + 1,
                connection_id: id.clone(),
                kind,
                at,
                detail,
            };
            log.notifications.push(record.clone());
            record
        };

        let notification_id = record.notification_id;
        self.publish(id, EventOutcome::Notification(record), state, version);
        Ok(notification_id)
    }

    /// Results of `id` with `result_id > since_id`, oldest first.
    pub fn results(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<ResultRecord>> {
        let logs = self.logs.read().map_err(|_| Error::LockPoisoned("notification log"))?;
        let since = since_id.unwrap_or(0);
        Ok(logs
            .get(id)
            .map(|log| log.results.iter().filter(|r| r.result_id > since).cloned().collect())
            .unwrap_or_default())
    }

    /// Notifications of `id` with `notification_id > since_id`, oldest first.
    pub fn notifications(&self, id: &ConnectionId, since_id: Option<u64>) -> Result<Vec<NotificationRecord>> {
        let logs = self.logs.read().map_err(|_| Error::LockPoisoned("notification log"))?;
        let since = since_id.unwrap_or(0);
        Ok(logs
            .get(id)
            .map(|log| log.notifications.iter().filter(|n| n.notification_id > since).cloned().collect())
            .unwrap_or_default())
    }

    /// Highest result id and highest notification id recorded for `id`.
    pub fn max_ids(&self, id: &ConnectionId) -> Result<(Option<u64>, Option<u64>)> {
        let logs = self.logs.read().map_err(|_| Error::LockPoisoned("notification log"))?;
        Ok(logs
            .get(id)
            .map(|log| {
                (log.results.last().map(|r| r.result_id), log.notifications.last().map(|n| n.notification_id))
            })
            .unwrap_or((None, None)))
    }

    fn publish(&self, id: &ConnectionId, outcome: EventOutcome, state: ReservationState, version: u64) {
        // No receivers is fine, the log is the source of truth.
        let _ = self.sender.send(ProviderEvent { connection_id: id.clone(), outcome, state, version });
    }
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new()
    }
}
