use std::fs::File;
use std::sync::{Mutex, mpsc};
use std::thread::{self, JoinHandle};

use crate::domain::provider::reservation::reservation::ReservationState;
use crate::domain::provider::utils::id::ConnectionId;
use crate::error::Result;

const HEADERS: [&str; 7] = ["Time", "ConnectionId", "Event", "FromState", "ToState", "Version", "Error"];

/// One row of the audit trail: an accepted transition or a recorded failure.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub time: i64,
    pub connection_id: ConnectionId,
    pub event: String,
    pub from: Option<ReservationState>,
    pub to: Option<ReservationState>,
    pub version: Option<u64>,
    pub error: Option<String>,
}

impl AuditEvent {
    fn to_row(&self) -> Vec<String> {
        fn or_na<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "NA".to_string())
        }

        vec![
            self.time.to_string(),
            self.connection_id.to_string(),
            self.event.clone(),
            or_na(&self.from),
            or_na(&self.to),
            or_na(&self.version),
            or_na(&self.error),
        ]
    }
}

/// Messages sent from the state machine to the writer thread.
enum AuditMessage {
    Record(AuditEvent),
    Shutdown,
}

/// `;`-separated CSV audit file written by a background thread.
///
/// Recording never blocks on file I/O.
#[derive(Debug)]
pub struct AuditTrail {
    sender: mpsc::Sender<AuditMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditTrail {
    /// Creates (truncates) the file and spawns the writer thread.
    pub fn init(path: &str) -> Result<Self> {
        let file = File::create(path)?;
        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(file);
        csv_wtr.write_record(HEADERS)?;
        csv_wtr.flush()?;

        let (tx, rx) = mpsc::channel();
        let writer = thread::spawn(move || Self::worker_loop(rx, csv_wtr));

        log::info!("Audit trail is written to '{}'.", path);
        Ok(AuditTrail { sender: tx, writer: Mutex::new(Some(writer)) })
    }

    fn worker_loop(rx: mpsc::Receiver<AuditMessage>, mut csv_wtr: csv::Writer<File>) {
        for msg in rx {
            match msg {
                AuditMessage::Record(event) => {
                    if let Err(e) = csv_wtr.write_record(event.to_row()).and_then(|_| csv_wtr.flush().map_err(csv::Error::from)) {
                        log::error!("Failed to write audit record: {}", e);
                    }
                }
                AuditMessage::Shutdown => break,
            }
        }

        if let Err(e) = csv_wtr.flush() {
            log::error!("Failed to flush audit trail: {}", e);
        }
    }

    pub fn record(&self, event: AuditEvent) {
        if self.sender.send(AuditMessage::Record(event)).is_err() {
            log::warn!("Audit trail is closed, record dropped.");
        }
    }

    /// Flushes pending records and stops the writer thread.
    pub fn shutdown(&self) {
        let _ = self.sender.send(AuditMessage::Shutdown);

        let handle = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Audit writer thread panicked.");
            }
        }
    }
}
