use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sleepwalk_protocol::ActivitySource;

/// One reading of the idle detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdleState {
    pub is_idle: bool,
    pub idle_for: Duration,
    pub last_activity_at: DateTime<Utc>,
    pub threshold: Duration,
}

impl IdleState {
    /// Zero once idle.
    pub fn time_until_idle(&self) -> Duration {
        self.threshold.saturating_sub(self.idle_for)
    }
}

/// Compares time since the last user input against a threshold.
#[derive(Clone)]
pub struct IdleSignal {
    source: Arc<dyn ActivitySource>,
    threshold: Duration,
}

impl IdleSignal {
    pub fn new(source: Arc<dyn ActivitySource>, threshold: Duration) -> Self {
        Self { source, threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn current_state(&self) -> IdleState {
        self.state_at(Utc::now())
    }

    /// A last activity in the future counts as no idle time at all.
    pub fn state_at(&self, now: DateTime<Utc>) -> IdleState {
        let last_activity_at = self.source.last_activity_at();
        let idle_for = (now - last_activity_at).to_std().unwrap_or(Duration::ZERO);
        IdleState {
            is_idle: idle_for >= self.threshold,
            idle_for,
            last_activity_at,
            threshold: self.threshold,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_state().is_idle
    }
}
