//! # sleepwalk-protocol — shared sleepwalker contract
//!
//! Types, error taxonomy, and capability ports shared by every sleepwalker
//! crate. There is no async runtime here. The only filesystem access is the
//! root resolution done once by [`SessionConfigBuilder::build`], so the crate
//! stays usable as a contract by front-ends and capability adapters.
//!
//! ## Module Overview
//!
//! - [`ids`] — typed ID wrappers (SessionId)
//! - [`discovery`] — Discovery, DiscoveryKind
//! - [`experience`] — ExperienceMode, Observation, Narrative
//! - [`session`] — SessionConfig, SessionResult, SessionState
//! - [`ports`] — activity, wake-lock, and text-generation capabilities
//! - [`error`] — SleepwalkError, SleepwalkResult

pub mod discovery;
pub mod error;
pub mod experience;
pub mod ids;
pub mod ports;
pub mod session;

pub use discovery::{Discovery, DiscoveryKind};
pub use error::{SleepwalkError, SleepwalkResult};
pub use experience::{ExperienceMode, Narrative, NarrativeSource, Observation};
pub use ids::SessionId;
pub use ports::{ActivitySource, TextGenerator, WakeLockProvider};
pub use session::{
    SessionConfig, SessionConfigBuilder, SessionResult, SessionState, SessionTuning,
};
