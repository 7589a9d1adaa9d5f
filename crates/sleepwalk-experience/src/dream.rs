//! Dream mode: poetic reflections on what the walk turned up.

use std::sync::Arc;

use async_trait::async_trait;
use sleepwalk_protocol::{
    Discovery, ExperienceMode, Narrative, Observation, SleepwalkError, SleepwalkResult,
    TextGenerator,
};
use tracing::{debug, info, instrument, warn};

use crate::prompts::format_dream_prompt;
use crate::{ExperienceCollector, ExperienceSynthesizer, GenerationPolicy, generate_bounded};

#[derive(Debug, Default)]
pub struct DreamCollector {
    observations: Vec<Observation>,
}

impl DreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn brief_note(discovery: &Discovery) -> String {
        if discovery.is_directory() {
            format!("Directory '{}' with various contents", discovery.name)
        } else if discovery.preview.is_some() {
            format!("File '{}' with personal content", discovery.name)
        } else {
            format!("File '{}' ({} bytes)", discovery.name, discovery.size_bytes)
        }
    }
}

impl ExperienceCollector for DreamCollector {
    fn mode(&self) -> ExperienceMode {
        ExperienceMode::Dream
    }

    fn accept(&mut self, discovery: &Discovery) {
        let note = Self::brief_note(discovery);
        debug!(note = %note, "dreaming of discovery");
        self.observations
            .push(Observation::from_discovery(ExperienceMode::Dream, discovery, note));
    }

    fn observations(&self) -> &[Observation] {
        &self.observations
    }
}

pub struct DreamSynthesizer {
    generator: Arc<dyn TextGenerator>,
    policy: GenerationPolicy,
}

impl DreamSynthesizer {
    pub fn new(generator: Arc<dyn TextGenerator>, policy: GenerationPolicy) -> Self {
        Self { generator, policy }
    }

    fn empty_dream() -> Narrative {
        Narrative::fallback("# Empty Dream\n\nI wandered but found only silence...")
    }

    fn placeholder_dream(observations: &[Observation]) -> Narrative {
        let (Some(first), Some(last)) = (observations.first(), observations.last()) else {
            return Self::empty_dream();
        };
        let mut lines = vec![
            "# Digital Dream".to_owned(),
            String::new(),
            format!(
                "*Session: {} - {}*",
                first.observed_at.format("%Y-%m-%d %H:%M"),
                last.observed_at.format("%H:%M")
            ),
            String::new(),
            "## The Dream".to_owned(),
            String::new(),
            "I wandered through digital corridors of forgotten intentions...".to_owned(),
            String::new(),
        ];
        lines.extend(
            observations
                .iter()
                .take(3)
                .map(|observation| format!("- {}", observation.note)),
        );
        lines.extend([
            String::new(),
            "The dream fades like morning mist, leaving only impressions of \
             a digital life lived in files and folders."
                .to_owned(),
            String::new(),
            format!(
                "*{} observations collected during this session*",
                observations.len()
            ),
        ]);
        Narrative::fallback(lines.join("\n"))
    }
}

#[async_trait]
impl ExperienceSynthesizer for DreamSynthesizer {
    fn mode(&self) -> ExperienceMode {
        ExperienceMode::Dream
    }

    #[instrument(
        skip(self, observations),
        fields(generator = self.generator.name(), observations = observations.len())
    )]
    async fn synthesize(&self, observations: &[Observation]) -> SleepwalkResult<Narrative> {
        if let Some(foreign) = observations
            .iter()
            .find(|observation| observation.mode != ExperienceMode::Dream)
        {
            return Err(SleepwalkError::InvalidState(format!(
                "dream synthesizer received a {} observation",
                foreign.mode
            )));
        }
        if observations.is_empty() {
            return Ok(Self::empty_dream());
        }

        let prompt = format_dream_prompt(observations);
        match generate_bounded(self.generator.as_ref(), &prompt, &self.policy).await {
            Ok(body) => {
                info!(chars = body.len(), "dream generated");
                Ok(Narrative::generated(body))
            }
            Err(error) => {
                warn!(error = %error, "generation degraded, using deterministic dream");
                Ok(Self::placeholder_dream(observations))
            }
        }
    }
}
