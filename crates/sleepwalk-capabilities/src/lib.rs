//! Concrete capability adapters.
//!
//! Each adapter implements one port from `sleepwalk_protocol::ports`:
//!
//! - [`ManualActivity`] — activity clock that front-ends bump on input
//! - [`CommandGenerator`] / [`UnavailableGenerator`] — text generation
//! - [`CommandWakeLock`] / [`NoopWakeLock`] — sleep inhibition

pub mod activity;
pub mod generator;
pub mod wake_lock;

pub use activity::ManualActivity;
pub use generator::{CommandGenerator, GeneratorLimits, UnavailableGenerator};
pub use wake_lock::{CommandWakeLock, NoopWakeLock};
