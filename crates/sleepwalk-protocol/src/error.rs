//! Error types for sleepwalker operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::experience::ExperienceMode;

/// Errors that can occur while configuring or running a sleepwalk session.
///
/// Only configuration and persistence failures terminate a session. The
/// capability variants are caught where they occur and downgraded to
/// warnings; traversal errors never leave the walk that produced them.
#[derive(Debug, Error)]
pub enum SleepwalkError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{mode} mode is not available yet (coming soon)")]
    UnsupportedMode { mode: ExperienceMode },
    #[error("wake lock unavailable: {0}")]
    WakeLockUnavailable(String),
    #[error("text generation unavailable: {0}")]
    GenerationUnavailable(String),
    #[error("text generation failed: {0}")]
    GenerationFailed(String),
    #[error("text generation timed out after {after_ms} ms")]
    GenerationTimedOut { after_ms: u64 },
    #[error("cannot read {path}: {source}")]
    Traversal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot persist artifact at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SleepwalkError {
    /// True for failures that must terminate a session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::UnsupportedMode { .. }
                | Self::Persistence { .. }
                | Self::InvalidState(_)
        )
    }

    /// True when a declared but unimplemented experience mode was requested.
    pub fn is_unsupported_mode(&self) -> bool {
        matches!(self, Self::UnsupportedMode { .. })
    }
}

/// Convenience result type for sleepwalker operations.
pub type SleepwalkResult<T> = Result<T, SleepwalkError>;
