use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use sleepwalk_experience::{ExperiencePipeline, ExperienceRegistry, fallback_narrative};
use sleepwalk_explorer::{ExplorationStats, ExplorerOptions, SafeExplorer};
use sleepwalk_protocol::{
    ActivitySource, SessionConfig, SessionId, SessionResult, SessionState, SleepwalkError,
    SleepwalkResult,
};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::idle::IdleSignal;
use crate::persist::{prune_artifacts, write_artifact};
use crate::shutdown::ShutdownSignal;
use crate::wake::WakeLock;

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub result: SessionResult,
    pub artifact: PathBuf,
    pub stats: ExplorationStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed(SessionReport),
    /// Carries a report only when something was collected before the
    /// interruption.
    Cancelled(Option<SessionReport>),
}

impl SessionOutcome {
    pub fn report(&self) -> Option<&SessionReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Cancelled(report) => report.as_ref(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

struct Exploration {
    interrupted: bool,
    stats: ExplorationStats,
}

/// One idle-gated sleepwalk, from waiting for idleness to a written
/// artifact.
pub struct SleepwalkSession {
    id: SessionId,
    config: SessionConfig,
    pipeline: ExperiencePipeline,
    idle: IdleSignal,
    wake_lock: WakeLock,
    explorer: SafeExplorer,
    shutdown: ShutdownSignal,
    state: watch::Sender<SessionState>,
    started: bool,
}

impl SleepwalkSession {
    /// Resolves the experience pipeline first, so an unsupported mode fails
    /// before the activity source or the filesystem is touched.
    pub fn new(
        config: SessionConfig,
        registry: &ExperienceRegistry,
        activity: Arc<dyn ActivitySource>,
        wake_lock: WakeLock,
        explorer_options: ExplorerOptions,
        shutdown: ShutdownSignal,
    ) -> SleepwalkResult<Self> {
        let pipeline = registry.create_pipeline(config.experience_mode())?;
        let explorer = SafeExplorer::new(config.allowed_roots(), explorer_options);
        if explorer.roots().is_empty() {
            return Err(SleepwalkError::InvalidConfig(
                "none of the allowed roots can be resolved".to_owned(),
            ));
        }
        let idle = IdleSignal::new(activity, config.idle_threshold());
        let (state, _) = watch::channel(SessionState::IdleWait);

        Ok(Self {
            id: SessionId::default(),
            config,
            pipeline,
            idle,
            wake_lock,
            explorer,
            shutdown,
            state,
            started: false,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn explorer(&self) -> &SafeExplorer {
        &self.explorer
    }

    pub fn wake_lock(&self) -> &WakeLock {
        &self.wake_lock
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drives the session to a terminal state. Only persistence failures and
    /// misuse surface as errors, and they leave the state where they
    /// happened. A session runs at most once, whatever way the first run
    /// ended.
    #[instrument(
        skip(self),
        fields(
            session_id = %self.id,
            mode = %self.config.experience_mode(),
            roots = self.explorer.roots().len()
        )
    )]
    pub async fn run(&mut self) -> SleepwalkResult<SessionOutcome> {
        if self.started {
            return Err(SleepwalkError::InvalidState(format!(
                "session {} already ran, last state {}",
                self.id,
                self.state()
            )));
        }
        self.started = true;

        self.set_state(SessionState::IdleWait);
        if !self.wait_for_idle().await {
            info!("shutdown requested before the machine went idle");
            self.set_state(SessionState::Cancelled);
            return Ok(SessionOutcome::Cancelled(None));
        }

        let started_at = Utc::now();
        self.set_state(SessionState::Exploring);
        let mut guard = self.wake_lock.acquire();
        let exploration = self.explore().await;
        let observation_count = self.pipeline.observation_count();
        info!(
            observations = observation_count,
            discovered = exploration.stats.discovered,
            skipped = exploration.stats.skipped,
            rejected = exploration.stats.rejected,
            interrupted = exploration.interrupted,
            "exploration finished"
        );

        if exploration.interrupted && observation_count == 0 {
            guard.release();
            self.set_state(SessionState::Cancelled);
            return Ok(SessionOutcome::Cancelled(None));
        }

        self.set_state(SessionState::Synthesizing);
        let mode = self.config.experience_mode();
        let narrative = match self.pipeline.synthesize().await {
            Ok(narrative) => narrative,
            Err(error) => {
                warn!(error = %error, "synthesis failed, using the generic narrative");
                fallback_narrative(mode, self.pipeline.observations())
            }
        };

        self.set_state(SessionState::Persisting);
        let result = SessionResult {
            session_id: self.id.clone(),
            mode,
            narrative: narrative.body,
            narrative_source: narrative.source,
            observation_count,
            explored_roots: self.explorer.roots().to_vec(),
            started_at,
            ended_at: Utc::now(),
            cancelled: exploration.interrupted,
        };
        let written = write_artifact(self.config.output_dir(), &result).await;
        guard.release();
        let artifact = written?;

        if let Some(keep) = self.config.tuning().retain_artifacts {
            match prune_artifacts(self.config.output_dir(), mode, keep).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, keep, "old artifacts pruned"),
                Err(error) => warn!(error = %error, "artifact retention failed"),
            }
        }

        let report = SessionReport {
            result,
            artifact,
            stats: exploration.stats,
        };
        if exploration.interrupted {
            self.set_state(SessionState::Cancelled);
            Ok(SessionOutcome::Cancelled(Some(report)))
        } else {
            self.set_state(SessionState::Done);
            Ok(SessionOutcome::Completed(report))
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "session state changed");
        }
    }

    /// False when shutdown was requested first.
    async fn wait_for_idle(&self) -> bool {
        let poll_interval = self.config.tuning().poll_interval;
        let needed = self.config.tuning().idle_confirmations;
        let mut confirmations = 0_u32;

        loop {
            if self.shutdown.is_requested() {
                return false;
            }
            let reading = self.idle.current_state();
            if reading.is_idle {
                confirmations += 1;
                debug!(confirmations, needed, idle_for = ?reading.idle_for, "idle reading");
                if confirmations >= needed {
                    info!(idle_for = ?reading.idle_for, "machine is idle");
                    return true;
                }
            } else {
                confirmations = 0;
            }

            tokio::select! {
                _ = self.shutdown.requested() => return false,
                _ = sleep(poll_interval) => {}
            }
        }
    }

    fn interruption(&self) -> Option<&'static str> {
        if self.shutdown.is_requested() {
            return Some("shutdown requested");
        }
        if !self.idle.current_state().is_idle {
            return Some("user activity");
        }
        None
    }

    async fn explore(&mut self) -> Exploration {
        let tuning = self.config.tuning().clone();
        let deadline = tuning.max_duration.map(|limit| Instant::now() + limit);
        let mut wander = self.explorer.wander();
        let mut ticker = interval(tuning.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut forwarded = 0_usize;

        let interrupted = loop {
            if let Some(reason) = self.interruption() {
                info!(reason, forwarded, "exploration interrupted");
                break true;
            }
            if tuning.max_discoveries.is_some_and(|max| forwarded >= max) {
                info!(forwarded, "discovery cap reached");
                break false;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                info!(forwarded, "exploration time cap reached");
                break false;
            }

            let cap = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let next = tokio::select! {
                biased;
                _ = self.shutdown.requested() => continue,
                _ = cap => continue,
                _ = ticker.tick() => continue,
                next = wander.next() => next,
            };
            let Some(discovery) = next else {
                break false;
            };
            if let Some(reason) = self.interruption() {
                info!(reason, forwarded, "exploration interrupted");
                break true;
            }
            self.pipeline.accept(&discovery);
            forwarded += 1;
        };

        Exploration {
            interrupted,
            stats: wander.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use parking_lot::Mutex;
    use sleepwalk_experience::{
        DreamCollector, DreamSynthesizer, ExperienceCollector, ExperienceContext,
        ExperiencePipeline, ExperienceRegistry, GenerationPolicy,
    };
    use sleepwalk_explorer::{ExplorerOptions, SafeExplorer};
    use sleepwalk_protocol::{
        ActivitySource, Discovery, ExperienceMode, NarrativeSource, Observation,
        SessionConfig, SessionState, SessionTuning, SleepwalkError, SleepwalkResult,
        TextGenerator, WakeLockProvider,
    };
    use tokio::fs;

    use super::{SessionOutcome, SleepwalkSession};
    use crate::shutdown::ShutdownSignal;
    use crate::testing::unique_test_root;
    use crate::wake::WakeLock;

    struct ScriptedActivity {
        last: Mutex<DateTime<Utc>>,
        reads: AtomicUsize,
    }

    impl ScriptedActivity {
        fn idle_for_an_hour() -> Arc<Self> {
            Arc::new(Self {
                last: Mutex::new(Utc::now() - TimeDelta::hours(1)),
                reads: AtomicUsize::new(0),
            })
        }

        fn busy() -> Arc<Self> {
            let activity = Self::idle_for_an_hour();
            activity.mark_active();
            activity
        }

        fn mark_active(&self) {
            *self.last.lock() = Utc::now() + TimeDelta::hours(1);
        }
    }

    impl ActivitySource for ScriptedActivity {
        fn last_activity_at(&self) -> DateTime<Utc> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            *self.last.lock()
        }
    }

    /// Idle on every other reading, busy in between.
    #[derive(Default)]
    struct FlickeringActivity {
        reads: AtomicUsize,
    }

    impl ActivitySource for FlickeringActivity {
        fn last_activity_at(&self) -> DateTime<Utc> {
            if self.reads.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Utc::now() - TimeDelta::hours(1)
            } else {
                Utc::now()
            }
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        begins: AtomicUsize,
        ends: AtomicUsize,
    }

    impl WakeLockProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn begin(&self) -> SleepwalkResult<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Reply {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct StubGenerator(Reply);

    #[async_trait]
    impl TextGenerator for StubGenerator {
        fn name(&self) -> &str {
            "stub"
        }

        async fn generate(&self, _prompt: &str) -> SleepwalkResult<String> {
            match self.0 {
                Reply::Text(text) => Ok(text.to_owned()),
                Reply::Fail => Err(SleepwalkError::GenerationFailed("model offline".to_owned())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_owned())
                }
            }
        }
    }

    /// Flips the activity source to busy as soon as it sees a discovery.
    struct WakingCollector {
        inner: DreamCollector,
        activity: Arc<ScriptedActivity>,
    }

    impl ExperienceCollector for WakingCollector {
        fn mode(&self) -> ExperienceMode {
            ExperienceMode::Dream
        }

        fn accept(&mut self, discovery: &Discovery) {
            self.inner.accept(discovery);
            self.activity.mark_active();
        }

        fn observations(&self) -> &[Observation] {
            self.inner.observations()
        }
    }

    /// Shares every forwarded discovery with the test.
    struct RecordingCollector {
        inner: DreamCollector,
        seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ExperienceCollector for RecordingCollector {
        fn mode(&self) -> ExperienceMode {
            ExperienceMode::Dream
        }

        fn accept(&mut self, discovery: &Discovery) {
            self.seen.lock().push(discovery.path.clone());
            self.inner.accept(discovery);
        }

        fn observations(&self) -> &[Observation] {
            self.inner.observations()
        }
    }

    fn registry(reply: Reply) -> ExperienceRegistry {
        let policy = GenerationPolicy::default()
            .timeout(Duration::from_millis(50))
            .attempts(1)
            .backoff(Duration::ZERO);
        ExperienceRegistry::with_builtin_modes(
            ExperienceContext::new(Arc::new(StubGenerator(reply))).generation(policy),
        )
    }

    fn config(root: &Path, sandbox: &Path) -> SessionConfig {
        config_with(root, sandbox, fast_tuning(), ExperienceMode::Dream)
    }

    fn config_with(
        root: &Path,
        sandbox: &Path,
        tuning: SessionTuning,
        mode: ExperienceMode,
    ) -> SessionConfig {
        SessionConfig::builder([sandbox])
            .idle_threshold(Duration::from_secs(1))
            .output_dir(root.join("dreams"))
            .experience_mode(mode)
            .tuning(tuning)
            .build()
            .expect("valid test config")
    }

    fn fast_tuning() -> SessionTuning {
        SessionTuning::default().poll_interval(Duration::from_millis(10))
    }

    async fn sandbox(name: &str, files: &[(&str, &str)]) -> Result<(PathBuf, PathBuf)> {
        let root = unique_test_root(name);
        let sandbox = root.join("sandbox");
        fs::create_dir_all(&sandbox).await?;
        for (file, content) in files {
            fs::write(sandbox.join(file), content).await?;
        }
        Ok((root, sandbox))
    }

    async fn artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            found.push(entry.path());
        }
        found.sort();
        Ok(found)
    }

    fn session(
        config: SessionConfig,
        registry: &ExperienceRegistry,
        activity: Arc<ScriptedActivity>,
        provider: Arc<CountingProvider>,
    ) -> SleepwalkResult<SleepwalkSession> {
        SleepwalkSession::new(
            config,
            registry,
            activity,
            WakeLock::new(provider),
            ExplorerOptions::default(),
            ShutdownSignal::new(),
        )
    }

    #[tokio::test]
    async fn end_to_end_sandbox_writes_one_artifact() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-e2e", &[("notes.txt", "0123456789")]).await?;
        let provider = Arc::new(CountingProvider::default());
        let mut session = session(
            config(&root, &sandbox),
            &registry(Reply::Text("X")),
            ScriptedActivity::idle_for_an_hour(),
            provider.clone(),
        )?;
        let states = session.subscribe_state();

        let outcome = session.run().await?;
        let report = match outcome {
            SessionOutcome::Completed(report) => report,
            other => panic!("expected a completed session, got {other:?}"),
        };
        assert_eq!(report.result.observation_count, 1);
        assert_eq!(report.result.narrative_source, NarrativeSource::Generated);
        assert!(!report.result.cancelled);
        assert_eq!(report.stats.discovered, 1);

        let written = artifacts(&root.join("dreams")).await?;
        assert_eq!(written, vec![report.artifact.clone()]);
        let content = fs::read_to_string(&report.artifact).await?;
        assert!(content.contains("observation_count: 1"));
        assert!(content.contains("outcome: completed"));
        assert!(content.trim_end().ends_with('X'));

        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(*states.borrow(), SessionState::Done);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 1);
        assert_eq!(provider.ends.load(Ordering::SeqCst), 1);
        assert!(!session.wake_lock().is_active());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn activity_after_first_discovery_cancels_with_partial_artifact() -> Result<()> {
        let (root, sandbox) = sandbox(
            "sleepwalk-session-cancel",
            &[("a.txt", "alpha"), ("b.txt", "bravo"), ("c.txt", "charlie")],
        )
        .await?;
        let activity = ScriptedActivity::idle_for_an_hour();
        let provider = Arc::new(CountingProvider::default());

        let mut registry = registry(Reply::Text("a partial dream"));
        let waking = activity.clone();
        registry.register(ExperienceMode::Dream, move |context: &ExperienceContext| {
            ExperiencePipeline::new(
                Box::new(WakingCollector {
                    inner: DreamCollector::new(),
                    activity: waking.clone(),
                }),
                Box::new(DreamSynthesizer::new(
                    context.generator.clone(),
                    context.generation.clone(),
                )),
            )
        });

        let mut session = session(config(&root, &sandbox), &registry, activity, provider.clone())?;
        let outcome = session.run().await?;

        let report = match outcome {
            SessionOutcome::Cancelled(Some(report)) => report,
            other => panic!("expected a cancelled session with a report, got {other:?}"),
        };
        assert_eq!(report.result.observation_count, 1);
        assert!(report.result.cancelled);
        let content = fs::read_to_string(&report.artifact).await?;
        assert!(content.contains("outcome: cancelled"));

        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 1);
        assert_eq!(provider.ends.load(Ordering::SeqCst), 1);
        assert!(!session.wake_lock().is_active());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_while_waiting_for_idle_leaves_no_trace() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-shutdown", &[("a.txt", "alpha")]).await?;
        let provider = Arc::new(CountingProvider::default());
        let shutdown = ShutdownSignal::new();
        let mut session = SleepwalkSession::new(
            config(&root, &sandbox),
            &registry(Reply::Text("unused")),
            ScriptedActivity::busy(),
            WakeLock::new(provider.clone()),
            ExplorerOptions::default(),
            shutdown.clone(),
        )?;

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.request();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.run()).await??;
        trigger.await?;

        assert!(matches!(outcome, SessionOutcome::Cancelled(None)));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 0);
        assert!(artifacts(&root.join("dreams")).await?.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_mode_fails_before_polling() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-unsupported", &[]).await?;
        let activity = ScriptedActivity::idle_for_an_hour();
        let provider = Arc::new(CountingProvider::default());

        let result = session(
            config_with(&root, &sandbox, fast_tuning(), ExperienceMode::Adventure),
            &registry(Reply::Text("unused")),
            activity.clone(),
            provider.clone(),
        );

        let error = result.err().expect("adventure mode is not available");
        assert!(error.is_unsupported_mode());
        assert_eq!(activity.reads.load(Ordering::SeqCst), 0);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 0);
        assert!(!root.join("dreams").exists());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn generator_failure_degrades_to_fallback_and_completes() -> Result<()> {
        for (name, reply) in [
            ("sleepwalk-session-fail", Reply::Fail),
            ("sleepwalk-session-hang", Reply::Hang),
        ] {
            let (root, sandbox) = sandbox(name, &[("notes.txt", "0123456789")]).await?;
            let mut session = session(
                config(&root, &sandbox),
                &registry(reply),
                ScriptedActivity::idle_for_an_hour(),
                Arc::new(CountingProvider::default()),
            )?;

            let outcome = session.run().await?;
            let report = match outcome {
                SessionOutcome::Completed(report) => report,
                other => panic!("expected a completed session, got {other:?}"),
            };
            assert_eq!(report.result.narrative_source, NarrativeSource::Fallback);
            assert!(!report.result.narrative.trim().is_empty());
            assert!(report.artifact.exists());
            assert_eq!(session.state(), SessionState::Done);

            let _ = fs::remove_dir_all(root).await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn forwarded_discoveries_stay_inside_the_roots() -> Result<()> {
        let (root, sandbox) = sandbox(
            "sleepwalk-session-containment",
            &[("inside.txt", "inside")],
        )
        .await?;
        fs::create_dir_all(root.join("outside")).await?;
        fs::write(root.join("outside/secret.txt"), "secret").await?;
        fs::create_dir_all(sandbox.join("nested")).await?;
        fs::write(sandbox.join("nested/deeper.txt"), "deeper").await?;
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(root.join("outside"), sandbox.join("escape"))?;
            std::os::unix::fs::symlink(
                root.join("outside/secret.txt"),
                sandbox.join("escape.txt"),
            )?;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = registry(Reply::Text("contained"));
        let recorder = seen.clone();
        registry.register(ExperienceMode::Dream, move |context: &ExperienceContext| {
            ExperiencePipeline::new(
                Box::new(RecordingCollector {
                    inner: DreamCollector::new(),
                    seen: recorder.clone(),
                }),
                Box::new(DreamSynthesizer::new(
                    context.generator.clone(),
                    context.generation.clone(),
                )),
            )
        });

        let mut session = session(
            config(&root, &sandbox),
            &registry,
            ScriptedActivity::idle_for_an_hour(),
            Arc::new(CountingProvider::default()),
        )?;
        let outcome = session.run().await?;
        assert!(matches!(outcome, SessionOutcome::Completed(_)));

        let explorer = SafeExplorer::new([&sandbox], ExplorerOptions::default());
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|path| explorer.is_safe_path(path)));
        assert!(!seen.iter().any(|path| path.ends_with("secret.txt")));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn discovery_cap_ends_exploration_normally() -> Result<()> {
        let (root, sandbox) = sandbox(
            "sleepwalk-session-cap",
            &[("1.txt", "1"), ("2.txt", "2"), ("3.txt", "3"), ("4.txt", "4")],
        )
        .await?;
        let mut session = session(
            config_with(
                &root,
                &sandbox,
                fast_tuning().max_discoveries(Some(2)),
                ExperienceMode::Dream,
            ),
            &registry(Reply::Text("capped")),
            ScriptedActivity::idle_for_an_hour(),
            Arc::new(CountingProvider::default()),
        )?;

        let outcome = session.run().await?;
        let report = match outcome {
            SessionOutcome::Completed(report) => report,
            other => panic!("expected a completed session, got {other:?}"),
        };
        assert_eq!(report.result.observation_count, 2);
        assert!(!report.result.cancelled);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn retention_prunes_older_artifacts_after_writing() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-retain", &[("a.txt", "alpha")]).await?;
        let output = root.join("dreams");
        fs::create_dir_all(&output).await?;
        fs::write(output.join("dream-20200101T000000.000Z-00000000.md"), "old").await?;

        let mut session = session(
            config_with(
                &root,
                &sandbox,
                fast_tuning().retain_artifacts(Some(1)),
                ExperienceMode::Dream,
            ),
            &registry(Reply::Text("fresh")),
            ScriptedActivity::idle_for_an_hour(),
            Arc::new(CountingProvider::default()),
        )?;
        let outcome = session.run().await?;
        let report = outcome.report().expect("completed session has a report");

        assert_eq!(artifacts(&output).await?, vec![report.artifact.clone()]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn finished_session_cannot_run_again() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-rerun", &[("a.txt", "alpha")]).await?;
        let mut session = session(
            config(&root, &sandbox),
            &registry(Reply::Text("once")),
            ScriptedActivity::idle_for_an_hour(),
            Arc::new(CountingProvider::default()),
        )?;
        session.run().await?;

        let again = session.run().await;
        assert!(matches!(again, Err(SleepwalkError::InvalidState(_))));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal_and_ends_the_session() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-blocked", &[("notes.txt", "0123456789")]).await?;
        let blocked = root.join("dreams");
        fs::write(&blocked, "not a directory").await?;
        let provider = Arc::new(CountingProvider::default());
        let mut session = session(
            config(&root, &sandbox),
            &registry(Reply::Text("never saved")),
            ScriptedActivity::idle_for_an_hour(),
            provider.clone(),
        )?;

        match session.run().await {
            Err(SleepwalkError::Persistence { path, .. }) => assert_eq!(path, blocked),
            other => panic!("expected a persistence error, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Persisting);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 1);
        assert_eq!(provider.ends.load(Ordering::SeqCst), 1);
        assert!(!session.wake_lock().is_active());

        fs::remove_file(&blocked).await?;
        let again = session.run().await;
        assert!(matches!(again, Err(SleepwalkError::InvalidState(_))));
        assert_eq!(provider.begins.load(Ordering::SeqCst), 1);
        assert!(artifacts(&blocked).await?.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    enum WakeUp {
        Shutdown,
        Activity,
    }

    #[tokio::test]
    async fn interruption_mid_walk_lands_within_a_few_poll_intervals() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-latency", &[]).await?;
        for index in 0..3000 {
            fs::create_dir(sandbox.join(format!("d{index:04}"))).await?;
        }
        let poll_interval = Duration::from_millis(20);

        for wake_up in [WakeUp::Shutdown, WakeUp::Activity] {
            let activity = ScriptedActivity::idle_for_an_hour();
            let provider = Arc::new(CountingProvider::default());
            let shutdown = ShutdownSignal::new();
            let mut session = SleepwalkSession::new(
                config_with(
                    &root,
                    &sandbox,
                    SessionTuning::default()
                        .poll_interval(poll_interval)
                        .max_discoveries(None),
                    ExperienceMode::Dream,
                ),
                &registry(Reply::Text("interrupted walk")),
                activity.clone(),
                WakeLock::new(provider.clone()),
                ExplorerOptions::default(),
                shutdown.clone(),
            )?;
            let mut states = session.subscribe_state();

            let interrupt = async {
                states
                    .wait_for(|state| *state == SessionState::Exploring)
                    .await
                    .map(|_| ())?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                match wake_up {
                    WakeUp::Shutdown => shutdown.request(),
                    WakeUp::Activity => activity.mark_active(),
                }
                let interrupted_at = Instant::now();
                states
                    .wait_for(|state| *state != SessionState::Exploring)
                    .await
                    .map(|_| ())?;
                Ok::<Duration, anyhow::Error>(interrupted_at.elapsed())
            };
            let (outcome, latency) = tokio::join!(session.run(), interrupt);
            let (outcome, latency) = (outcome?, latency?);

            let report = match outcome {
                SessionOutcome::Cancelled(Some(report)) => report,
                other => panic!("expected a cancelled session with a report, got {other:?}"),
            };
            assert!(report.result.cancelled);
            assert!(report.result.observation_count > 0);
            assert!(report.result.observation_count < 3000);
            assert!(latency < poll_interval * 10, "cancellation took {latency:?}");
            assert_eq!(session.state(), SessionState::Cancelled);
            assert_eq!(provider.ends.load(Ordering::SeqCst), 1);
        }

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn flickering_idle_readings_never_start_exploring() -> Result<()> {
        let (root, sandbox) = sandbox("sleepwalk-session-flicker", &[("a.txt", "alpha")]).await?;
        let activity = Arc::new(FlickeringActivity::default());
        let provider = Arc::new(CountingProvider::default());
        let shutdown = ShutdownSignal::new();
        let mut session = SleepwalkSession::new(
            config(&root, &sandbox),
            &registry(Reply::Text("unused")),
            activity.clone(),
            WakeLock::new(provider.clone()),
            ExplorerOptions::default(),
            shutdown.clone(),
        )?;
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.request();
        });
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.run()).await??;
        trigger.await?;

        assert!(matches!(outcome, SessionOutcome::Cancelled(None)));
        assert!(activity.reads.load(Ordering::SeqCst) >= 4);
        assert_eq!(provider.begins.load(Ordering::SeqCst), 0);
        assert!(artifacts(&root.join("dreams")).await?.is_empty());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
