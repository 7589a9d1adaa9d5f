use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sleepwalk_protocol::WakeLockProvider;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WakeLockStats {
    pub activation_count: u64,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub last_deactivated_at: Option<DateTime<Utc>>,
}

struct WakeLockShared {
    provider: Arc<dyn WakeLockProvider>,
    active: AtomicBool,
    stats: Mutex<WakeLockStats>,
}

/// Single-owner sleep inhibition over a [`WakeLockProvider`].
#[derive(Clone)]
pub struct WakeLock {
    shared: Arc<WakeLockShared>,
}

impl WakeLock {
    pub fn new(provider: Arc<dyn WakeLockProvider>) -> Self {
        Self {
            shared: Arc::new(WakeLockShared {
                provider,
                active: AtomicBool::new(false),
                stats: Mutex::new(WakeLockStats::default()),
            }),
        }
    }

    /// Never fails. A provider that cannot begin, or a lock that is already
    /// held, yields a degraded guard that releases nothing.
    pub fn acquire(&self) -> WakeLockGuard {
        let shared = &self.shared;
        if shared
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                provider = shared.provider.name(),
                "wake lock already held, continuing without a second one"
            );
            return WakeLockGuard::degraded(self.shared.clone());
        }

        match shared.provider.begin() {
            Ok(()) => {
                let mut stats = shared.stats.lock();
                stats.activation_count += 1;
                stats.last_activated_at = Some(Utc::now());
                info!(provider = shared.provider.name(), "wake lock acquired");
                WakeLockGuard {
                    shared: self.shared.clone(),
                    owns: true,
                    released: false,
                }
            }
            Err(error) => {
                shared.active.store(false, Ordering::Release);
                warn!(
                    provider = shared.provider.name(),
                    error = %error,
                    "wake lock unavailable, machine may sleep during the session"
                );
                WakeLockGuard::degraded(self.shared.clone())
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WakeLockStats {
        self.shared.stats.lock().clone()
    }

    pub fn provider_name(&self) -> &str {
        self.shared.provider.name()
    }
}

/// Releases the lock on [`release`](Self::release) or drop, whichever comes
/// first.
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeLockGuard {
    shared: Arc<WakeLockShared>,
    owns: bool,
    released: bool,
}

impl WakeLockGuard {
    fn degraded(shared: Arc<WakeLockShared>) -> Self {
        Self {
            shared,
            owns: false,
            released: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.owns
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.owns {
            debug!("degraded wake lock guard released");
            return;
        }

        self.shared.provider.end();
        self.shared.stats.lock().last_deactivated_at = Some(Utc::now());
        self.shared.active.store(false, Ordering::Release);
        info!(provider = self.shared.provider.name(), "wake lock released");
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
