//! Capability ports consumed by the session engine.
//!
//! These traits are the only boundary between the core and platform
//! integrations (input-event listeners, OS sleep inhibition, language-model
//! backends). The core never touches global hook state directly, so every
//! port can be replaced by a deterministic fake in tests.
//!
//! Object-safety note:
//! - `TextGenerator` uses `async-trait` for async dyn-dispatch.
//! - `ActivitySource` and `WakeLockProvider` are synchronous: the former is a
//!   pure query polled at high frequency, the latter must be callable from
//!   `Drop`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SleepwalkResult;

/// Source of the most recent user input timestamp.
pub trait ActivitySource: Send + Sync {
    fn last_activity_at(&self) -> DateTime<Utc>;
}

/// Platform primitive that inhibits sleep and display lock.
///
/// `end` must be idempotent and must tolerate being called without a
/// successful `begin`.
pub trait WakeLockProvider: Send + Sync {
    fn name(&self) -> &str;
    fn begin(&self) -> SleepwalkResult<()>;
    fn end(&self);
}

/// Remote or local text generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> SleepwalkResult<String>;
}
