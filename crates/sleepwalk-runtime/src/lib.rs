//! # sleepwalk-runtime — the session engine
//!
//! A session waits for the machine to go idle, holds it awake, wanders the
//! allowed roots, turns what it found into a narrative and writes one
//! artifact. User activity or a shutdown request ends it early.
//!
//! ## Module Overview
//!
//! - [`idle`] — IdleSignal over an injected activity source
//! - [`wake`] — WakeLock with a scoped, idempotent guard
//! - [`shutdown`] — cooperative cancellation signal
//! - [`persist`] — artifact naming, rendering, writing, retention
//! - [`session`] — SleepwalkSession state machine

pub mod idle;
pub mod persist;
pub mod session;
pub mod shutdown;
pub mod wake;

pub use idle::{IdleSignal, IdleState};
pub use session::{SessionOutcome, SessionReport, SleepwalkSession};
pub use shutdown::ShutdownSignal;
pub use wake::{WakeLock, WakeLockGuard, WakeLockStats};
