use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" for every deadline the provider agent computes.
///
/// Production code uses [`WallClock`]; tests swap in a settable clock so that
/// reserve timeouts can be crossed without waiting for them.
pub trait SystemClock: std::fmt::Debug + Send + Sync {
    fn get_current_time_in_ms(&self) -> i64;

    fn get_current_time_in_s(&self) -> i64 {
        self.get_current_time_in_ms() / 1000
    }
}

pub type SharedClock = Arc<dyn SystemClock>;

#[derive(Debug, Clone, Default)]
pub struct WallClock;

impl WallClock {
    pub fn shared() -> SharedClock {
        Arc::new(WallClock)
    }
}

impl SystemClock for WallClock {
    fn get_current_time_in_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
    }
}

/// Converts a duration into clock milliseconds, saturating on overflow.
pub fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Time left until `deadline_ms`, zero if it already passed.
pub fn remaining_until(deadline_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_ms).max(0) as u64)
}
