//! Session configuration, state, and result types.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{SleepwalkError, SleepwalkResult};
use crate::experience::{ExperienceMode, NarrativeSource};
use crate::ids::SessionId;

pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(900);
pub const DEFAULT_OUTPUT_DIR: &str = ".sleepwalker/dreams";

/// Orchestrator knobs that do not change what a session means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTuning {
    /// Cadence of idle polling, and the upper bound on cancellation latency
    /// while exploring.
    pub poll_interval: Duration,
    /// Consecutive idle readings required before exploration starts.
    pub idle_confirmations: u32,
    pub max_discoveries: Option<usize>,
    pub max_duration: Option<Duration>,
    /// Keep only this many artifacts of the session's mode in the output dir.
    pub retain_artifacts: Option<usize>,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            idle_confirmations: 2,
            max_discoveries: Some(100),
            max_duration: Some(Duration::from_secs(60 * 60)),
            retain_artifacts: None,
        }
    }
}

impl SessionTuning {
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn idle_confirmations(mut self, idle_confirmations: u32) -> Self {
        self.idle_confirmations = idle_confirmations;
        self
    }

    pub fn max_discoveries(mut self, max_discoveries: Option<usize>) -> Self {
        self.max_discoveries = max_discoveries;
        self
    }

    pub fn max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn retain_artifacts(mut self, retain_artifacts: Option<usize>) -> Self {
        self.retain_artifacts = retain_artifacts;
        self
    }

    fn validate(&self) -> SleepwalkResult<()> {
        if self.poll_interval.is_zero() {
            return Err(SleepwalkError::InvalidConfig(
                "poll interval must be positive".to_owned(),
            ));
        }
        if self.idle_confirmations < 2 {
            return Err(SleepwalkError::InvalidConfig(format!(
                "idle confirmations must be at least 2, got {}",
                self.idle_confirmations
            )));
        }
        if self.max_discoveries == Some(0) {
            return Err(SleepwalkError::InvalidConfig(
                "max discoveries must be positive when set".to_owned(),
            ));
        }
        if self.max_duration.is_some_and(|limit| limit.is_zero()) {
            return Err(SleepwalkError::InvalidConfig(
                "max duration must be positive when set".to_owned(),
            ));
        }
        if self.retain_artifacts == Some(0) {
            return Err(SleepwalkError::InvalidConfig(
                "artifact retention must keep at least one file".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Validated, immutable configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    allowed_roots: IndexSet<PathBuf>,
    idle_threshold: Duration,
    experience_mode: ExperienceMode,
    output_dir: PathBuf,
    tuning: SessionTuning,
}

impl SessionConfig {
    pub fn builder<I, P>(allowed_roots: I) -> SessionConfigBuilder
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        SessionConfigBuilder {
            allowed_roots: allowed_roots.into_iter().map(Into::into).collect(),
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            experience_mode: ExperienceMode::Dream,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            tuning: SessionTuning::default(),
        }
    }

    /// Canonical roots, in the order they were configured.
    pub fn allowed_roots(&self) -> &IndexSet<PathBuf> {
        &self.allowed_roots
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn experience_mode(&self) -> ExperienceMode {
        self.experience_mode
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn tuning(&self) -> &SessionTuning {
        &self.tuning
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    allowed_roots: Vec<PathBuf>,
    idle_threshold: Duration,
    experience_mode: ExperienceMode,
    output_dir: PathBuf,
    tuning: SessionTuning,
}

impl SessionConfigBuilder {
    pub fn idle_threshold(mut self, idle_threshold: Duration) -> Self {
        self.idle_threshold = idle_threshold;
        self
    }

    pub fn experience_mode(mut self, experience_mode: ExperienceMode) -> Self {
        self.experience_mode = experience_mode;
        self
    }

    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn tuning(mut self, tuning: SessionTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Validates every field and canonicalizes the allowed roots.
    pub fn build(self) -> SleepwalkResult<SessionConfig> {
        if self.allowed_roots.is_empty() {
            return Err(SleepwalkError::InvalidConfig(
                "at least one allowed root is required".to_owned(),
            ));
        }
        if self.idle_threshold.is_zero() {
            return Err(SleepwalkError::InvalidConfig(
                "idle threshold must be positive".to_owned(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(SleepwalkError::InvalidConfig(
                "output directory must not be empty".to_owned(),
            ));
        }
        self.tuning.validate()?;

        let mut allowed_roots = IndexSet::new();
        for root in &self.allowed_roots {
            allowed_roots.insert(validate_root(root)?);
        }

        Ok(SessionConfig {
            allowed_roots,
            idle_threshold: self.idle_threshold,
            experience_mode: self.experience_mode,
            output_dir: self.output_dir,
            tuning: self.tuning,
        })
    }
}

fn validate_root(root: &Path) -> SleepwalkResult<PathBuf> {
    let canonical = root.canonicalize().map_err(|error| {
        SleepwalkError::InvalidConfig(format!(
            "allowed root {} cannot be resolved: {error}",
            root.display()
        ))
    })?;
    if !canonical.is_dir() {
        return Err(SleepwalkError::InvalidConfig(format!(
            "allowed root {} is not a directory",
            root.display()
        )));
    }
    std::fs::read_dir(&canonical).map_err(|error| {
        SleepwalkError::InvalidConfig(format!(
            "allowed root {} is not readable: {error}",
            root.display()
        ))
    })?;
    Ok(canonical)
}

/// Orchestrator state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    IdleWait,
    Exploring,
    Synthesizing,
    Persisting,
    Done,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdleWait => "idle_wait",
            Self::Exploring => "exploring",
            Self::Synthesizing => "synthesizing",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produced once per session that reaches synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub mode: ExperienceMode,
    pub narrative: String,
    pub narrative_source: NarrativeSource,
    pub observation_count: usize,
    pub explored_roots: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when the user came back before exploration finished.
    pub cancelled: bool,
}
