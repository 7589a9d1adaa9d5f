use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sleepwalk_protocol::ActivitySource;

/// Activity clock driven by explicit calls instead of OS input hooks.
#[derive(Debug)]
pub struct ManualActivity {
    last_activity_at: RwLock<DateTime<Utc>>,
}

impl ManualActivity {
    /// Starts the clock as if input happened just now.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(last_activity_at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at: RwLock::new(last_activity_at),
        }
    }

    pub fn record_activity(&self) {
        self.record_activity_at(Utc::now());
    }

    /// Timestamps never move backwards.
    pub fn record_activity_at(&self, at: DateTime<Utc>) {
        let mut last = self.last_activity_at.write();
        if at > *last {
            *last = at;
        }
    }
}

impl Default for ManualActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for ManualActivity {
    fn last_activity_at(&self) -> DateTime<Utc> {
        *self.last_activity_at.read()
    }
}
