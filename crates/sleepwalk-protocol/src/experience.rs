//! Experience modes, observations, and narratives.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discovery::{Discovery, DiscoveryKind};
use crate::error::SleepwalkError;

/// Narrative style of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceMode {
    Dream,
    Adventure,
    Scrapbook,
    Journal,
}

impl ExperienceMode {
    pub const ALL: [ExperienceMode; 4] = [
        ExperienceMode::Dream,
        ExperienceMode::Adventure,
        ExperienceMode::Scrapbook,
        ExperienceMode::Journal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dream => "dream",
            Self::Adventure => "adventure",
            Self::Scrapbook => "scrapbook",
            Self::Journal => "journal",
        }
    }
}

impl fmt::Display for ExperienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperienceMode {
    type Err = SleepwalkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| SleepwalkError::InvalidConfig(format!("unknown experience mode: {value}")))
    }
}

/// A discovery annotated by a collector of one specific mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub mode: ExperienceMode,
    pub path: PathBuf,
    pub name: String,
    pub kind: DiscoveryKind,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Short human description produced by the collector.
    pub note: String,
}

impl Observation {
    pub fn from_discovery(
        mode: ExperienceMode,
        discovery: &Discovery,
        note: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            path: discovery.path.clone(),
            name: discovery.name.clone(),
            kind: discovery.kind,
            size_bytes: discovery.size_bytes,
            modified_at: discovery.modified_at,
            observed_at: Utc::now(),
            preview: discovery.preview.clone(),
            note: note.into(),
        }
    }
}

/// Where a narrative body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Generated,
    Fallback,
}

impl NarrativeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Fallback => "fallback",
        }
    }
}

/// Output of a synthesizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Narrative {
    pub body: String,
    pub source: NarrativeSource,
}

impl Narrative {
    pub fn generated(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            source: NarrativeSource::Generated,
        }
    }

    pub fn fallback(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            source: NarrativeSource::Fallback,
        }
    }
}
