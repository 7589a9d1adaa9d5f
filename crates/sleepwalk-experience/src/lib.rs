//! Experience pipelines.
//!
//! A pipeline pairs a collector (discoveries → observations) with a
//! synthesizer (observations → narrative) of the same [`ExperienceMode`].
//! The [`ExperienceRegistry`] is the factory the session engine uses; new
//! modes are added by registering a constructor, never by touching the
//! orchestrator.

pub mod dream;
pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sleepwalk_protocol::{
    Discovery, ExperienceMode, Narrative, Observation, SleepwalkError, SleepwalkResult,
    TextGenerator,
};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

pub use dream::{DreamCollector, DreamSynthesizer};

pub trait ExperienceCollector: Send + Sync {
    fn mode(&self) -> ExperienceMode;
    fn accept(&mut self, discovery: &Discovery);
    fn observations(&self) -> &[Observation];
}

#[async_trait]
pub trait ExperienceSynthesizer: Send + Sync {
    fn mode(&self) -> ExperienceMode;
    async fn synthesize(&self, observations: &[Observation]) -> SleepwalkResult<Narrative>;
}

/// A collector and synthesizer that agree on their mode.
pub struct ExperiencePipeline {
    collector: Box<dyn ExperienceCollector>,
    synthesizer: Box<dyn ExperienceSynthesizer>,
}

impl ExperiencePipeline {
    pub fn new(
        collector: Box<dyn ExperienceCollector>,
        synthesizer: Box<dyn ExperienceSynthesizer>,
    ) -> SleepwalkResult<Self> {
        if collector.mode() != synthesizer.mode() {
            return Err(SleepwalkError::InvalidState(format!(
                "collector mode {} does not match synthesizer mode {}",
                collector.mode(),
                synthesizer.mode()
            )));
        }
        Ok(Self {
            collector,
            synthesizer,
        })
    }

    pub fn mode(&self) -> ExperienceMode {
        self.collector.mode()
    }

    pub fn accept(&mut self, discovery: &Discovery) {
        self.collector.accept(discovery);
    }

    pub fn observations(&self) -> &[Observation] {
        self.collector.observations()
    }

    pub fn observation_count(&self) -> usize {
        self.collector.observations().len()
    }

    /// Synthesizes this pipeline's own observations.
    pub async fn synthesize(&self) -> SleepwalkResult<Narrative> {
        self.synthesizer
            .synthesize(self.collector.observations())
            .await
    }

    pub fn into_parts(self) -> (Box<dyn ExperienceCollector>, Box<dyn ExperienceSynthesizer>) {
        (self.collector, self.synthesizer)
    }
}

/// Bounds on a single narrative generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationPolicy {
    /// Per-attempt wait before the call is abandoned.
    pub timeout: Duration,
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

impl GenerationPolicy {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Calls `generator` under `policy`. Unavailability is not retried; empty
/// responses, errors, and timeouts are, up to `policy.attempts`.
pub async fn generate_bounded(
    generator: &dyn TextGenerator,
    prompt: &str,
    policy: &GenerationPolicy,
) -> SleepwalkResult<String> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let error = match timeout(policy.timeout, generator.generate(prompt)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => return Ok(text.trim().to_owned()),
            Ok(Ok(_)) => SleepwalkError::GenerationFailed("empty response".to_owned()),
            Ok(Err(error @ SleepwalkError::GenerationUnavailable(_))) => return Err(error),
            Ok(Err(error)) => error,
            Err(_) => SleepwalkError::GenerationTimedOut {
                after_ms: policy.timeout.as_millis() as u64,
            },
        };
        debug!(
            generator = generator.name(),
            attempt,
            attempts,
            error = %error,
            "generation attempt failed"
        );
        last_error = Some(error);
        if attempt < attempts {
            sleep(policy.backoff * attempt).await;
        }
    }

    Err(last_error
        .unwrap_or_else(|| SleepwalkError::GenerationFailed("no attempts made".to_owned())))
}

/// Mode-agnostic narrative used when a synthesizer fails outright.
pub fn fallback_narrative(mode: ExperienceMode, observations: &[Observation]) -> Narrative {
    let mut lines = vec![
        format!("# Quiet {mode}"),
        String::new(),
        "The wandering left only impressions behind:".to_owned(),
        String::new(),
    ];
    lines.extend(
        observations
            .iter()
            .take(3)
            .map(|observation| format!("- {}", observation.note)),
    );
    if observations.is_empty() {
        lines.push("- nothing at all, only silence".to_owned());
    }
    lines.push(String::new());
    lines.push(format!(
        "*{} observations collected during this session*",
        observations.len()
    ));
    Narrative::fallback(lines.join("\n"))
}

/// Shared dependencies handed to every pipeline constructor.
#[derive(Clone)]
pub struct ExperienceContext {
    pub generator: Arc<dyn TextGenerator>,
    pub generation: GenerationPolicy,
}

impl ExperienceContext {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            generation: GenerationPolicy::default(),
        }
    }

    pub fn generation(mut self, generation: GenerationPolicy) -> Self {
        self.generation = generation;
        self
    }
}

pub type PipelineConstructor =
    Arc<dyn Fn(&ExperienceContext) -> SleepwalkResult<ExperiencePipeline> + Send + Sync>;

#[derive(Clone)]
pub enum ExperienceEntry {
    Available(PipelineConstructor),
    /// Declared mode without an implementation; always fails fast.
    ComingSoon,
}

/// Lookup table from mode tag to pipeline constructor.
#[derive(Clone)]
pub struct ExperienceRegistry {
    entries: HashMap<ExperienceMode, ExperienceEntry>,
    context: ExperienceContext,
}

impl ExperienceRegistry {
    /// A registry with no modes at all.
    pub fn new(context: ExperienceContext) -> Self {
        Self {
            entries: HashMap::new(),
            context,
        }
    }

    /// Dream is available; every other declared mode is coming soon.
    pub fn with_builtin_modes(context: ExperienceContext) -> Self {
        let mut registry = Self::new(context);
        registry.register(ExperienceMode::Dream, |context: &ExperienceContext| {
            ExperiencePipeline::new(
                Box::new(DreamCollector::new()),
                Box::new(DreamSynthesizer::new(
                    context.generator.clone(),
                    context.generation.clone(),
                )),
            )
        });
        for mode in [
            ExperienceMode::Adventure,
            ExperienceMode::Scrapbook,
            ExperienceMode::Journal,
        ] {
            registry.declare_coming_soon(mode);
        }
        registry
    }

    pub fn register<F>(&mut self, mode: ExperienceMode, constructor: F)
    where
        F: Fn(&ExperienceContext) -> SleepwalkResult<ExperiencePipeline> + Send + Sync + 'static,
    {
        self.entries
            .insert(mode, ExperienceEntry::Available(Arc::new(constructor)));
    }

    pub fn declare_coming_soon(&mut self, mode: ExperienceMode) {
        self.entries.insert(mode, ExperienceEntry::ComingSoon);
    }

    pub fn is_available(&self, mode: ExperienceMode) -> bool {
        matches!(self.entries.get(&mode), Some(ExperienceEntry::Available(_)))
    }

    pub fn context(&self) -> &ExperienceContext {
        &self.context
    }

    pub fn create_pipeline(&self, mode: ExperienceMode) -> SleepwalkResult<ExperiencePipeline> {
        let constructor = match self.entries.get(&mode) {
            Some(ExperienceEntry::Available(constructor)) => constructor,
            Some(ExperienceEntry::ComingSoon) | None => {
                warn!(%mode, "requested experience mode is not available");
                return Err(SleepwalkError::UnsupportedMode { mode });
            }
        };
        let pipeline = constructor(&self.context)?;
        if pipeline.mode() != mode {
            return Err(SleepwalkError::InvalidState(format!(
                "constructor registered for {mode} built a {} pipeline",
                pipeline.mode()
            )));
        }
        Ok(pipeline)
    }

    pub fn create_collector(
        &self,
        mode: ExperienceMode,
    ) -> SleepwalkResult<Box<dyn ExperienceCollector>> {
        Ok(self.create_pipeline(mode)?.into_parts().0)
    }

    pub fn create_synthesizer(
        &self,
        mode: ExperienceMode,
    ) -> SleepwalkResult<Box<dyn ExperienceSynthesizer>> {
        Ok(self.create_pipeline(mode)?.into_parts().1)
    }
}
