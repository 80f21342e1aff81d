//! Wall-clock source for deadline and idle checks

use chrono::{DateTime, Utc};

/// Source of "now" for the lifecycle engine.
///
/// Deadlines are compared against this clock rather than sweep counts, so a
/// slow sweep cadence still times agents out.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
