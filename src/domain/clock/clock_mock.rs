use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::domain::clock::clock::{SystemClock, duration_to_ms};

/// Manually driven clock shared between a test and the agent under test.
#[derive(Debug, Clone)]
pub struct MockClock {
    pub time: Arc<RwLock<i64>>,
}

impl MockClock {
    pub fn new(time_ms: i64) -> MockClock {
        MockClock { time: Arc::new(RwLock::new(time_ms)) }
    }

    pub fn set_time_in_s(&self, time_s: i64) {
        self.set_time_in_ms(time_s * 1000);
    }

    pub fn set_time_in_ms(&self, time_ms: i64) {
        *self.time.write().unwrap_or_else(PoisonError::into_inner) = time_ms;
    }

    pub fn advance(&self, by: Duration) {
        *self.time.write().unwrap_or_else(PoisonError::into_inner) += duration_to_ms(by);
    }
}

impl SystemClock for MockClock {
    fn get_current_time_in_ms(&self) -> i64 {
        *self.time.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let clock = MockClock::new(0);
        let observer = clock.clone();
        clock.set_time_in_s(60);
        assert_eq!(observer.get_current_time_in_s(), 60);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(observer.get_current_time_in_ms(), 61_500);
    }
}
