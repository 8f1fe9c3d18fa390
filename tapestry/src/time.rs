//! Wall-clock source used for entity timestamps and TTL checks

use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time in milliseconds since the Unix epoch
pub trait Time: Send + Sync {
    fn current_time_millis(&self) -> i64;
}

/// System clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl Time for SystemTime {
    fn current_time_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct FakeTime {
    millis: AtomicI64,
}

impl FakeTime {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Time for FakeTime {
    fn current_time_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
