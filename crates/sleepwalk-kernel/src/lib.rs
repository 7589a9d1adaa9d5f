use std::sync::Arc;

use sleepwalk_capabilities::{CommandWakeLock, ManualActivity, NoopWakeLock, UnavailableGenerator};
use sleepwalk_experience::{ExperienceContext, ExperienceRegistry, GenerationPolicy};
use sleepwalk_explorer::ExplorerOptions;
use sleepwalk_protocol::{
    ActivitySource, SessionConfig, SleepwalkResult, TextGenerator, WakeLockProvider,
};
use sleepwalk_runtime::{SessionOutcome, ShutdownSignal, SleepwalkSession, WakeLock};
use tracing::{info, instrument};

pub struct SleepwalkerBuilder {
    config: SessionConfig,
    generator: Arc<dyn TextGenerator>,
    generation: GenerationPolicy,
    activity: Option<Arc<dyn ActivitySource>>,
    wake_lock_provider: Option<Arc<dyn WakeLockProvider>>,
    explorer_options: ExplorerOptions,
    shutdown: ShutdownSignal,
}

impl SleepwalkerBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            generator: Arc::new(UnavailableGenerator::default()),
            generation: GenerationPolicy::default(),
            activity: None,
            wake_lock_provider: None,
            explorer_options: ExplorerOptions::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn generation_policy(mut self, generation: GenerationPolicy) -> Self {
        self.generation = generation;
        self
    }

    pub fn activity(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn wake_lock_provider(mut self, provider: Arc<dyn WakeLockProvider>) -> Self {
        self.wake_lock_provider = Some(provider);
        self
    }

    pub fn explorer_options(mut self, options: ExplorerOptions) -> Self {
        self.explorer_options = options;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Without an explicit provider the platform inhibitor is used, or no
    /// inhibition at all where none exists.
    pub fn build(self) -> Sleepwalker {
        let activity = self
            .activity
            .unwrap_or_else(|| Arc::new(ManualActivity::new()) as Arc<dyn ActivitySource>);
        let provider = self.wake_lock_provider.unwrap_or_else(|| {
            match CommandWakeLock::platform_default() {
                Some(lock) => Arc::new(lock) as Arc<dyn WakeLockProvider>,
                None => Arc::new(NoopWakeLock),
            }
        });
        let registry = ExperienceRegistry::with_builtin_modes(
            ExperienceContext::new(self.generator).generation(self.generation),
        );

        Sleepwalker {
            config: self.config,
            registry,
            activity,
            wake_lock: WakeLock::new(provider),
            explorer_options: self.explorer_options,
            shutdown: self.shutdown,
        }
    }
}

/// Everything a front-end needs to start sessions.
#[derive(Clone)]
pub struct Sleepwalker {
    config: SessionConfig,
    registry: ExperienceRegistry,
    activity: Arc<dyn ActivitySource>,
    wake_lock: WakeLock,
    explorer_options: ExplorerOptions,
    shutdown: ShutdownSignal,
}

impl Sleepwalker {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExperienceRegistry {
        &self.registry
    }

    /// Mutable access for registering additional experience modes.
    pub fn registry_mut(&mut self) -> &mut ExperienceRegistry {
        &mut self.registry
    }

    pub fn wake_lock(&self) -> &WakeLock {
        &self.wake_lock
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Fails with `UnsupportedMode` for declared but unimplemented modes.
    pub fn new_session(&self) -> SleepwalkResult<SleepwalkSession> {
        SleepwalkSession::new(
            self.config.clone(),
            &self.registry,
            self.activity.clone(),
            self.wake_lock.clone(),
            self.explorer_options.clone(),
            self.shutdown.clone(),
        )
    }

    #[instrument(skip(self), fields(mode = %self.config.experience_mode()))]
    pub async fn run_once(&self) -> SleepwalkResult<SessionOutcome> {
        let mut session = self.new_session()?;
        info!(
            session_id = %session.id(),
            idle_threshold_secs = self.config.idle_threshold().as_secs(),
            wake_lock = self.wake_lock.provider_name(),
            "waiting for the machine to go idle"
        );
        session.run().await
    }
}
