use chrono::{DateTime, Utc};

/// Source of wall-clock time. Components that stamp or compare timestamps
/// take this as a collaborator so tests can run against a fixed clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The process clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
