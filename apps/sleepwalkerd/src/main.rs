use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use sleepwalk_capabilities::{
    CommandGenerator, GeneratorLimits, ManualActivity, NoopWakeLock, UnavailableGenerator,
};
use sleepwalk_experience::GenerationPolicy;
use sleepwalk_kernel::SleepwalkerBuilder;
use sleepwalk_protocol::session::{DEFAULT_IDLE_THRESHOLD, DEFAULT_OUTPUT_DIR};
use sleepwalk_protocol::{ExperienceMode, SessionConfig, SessionTuning, TextGenerator};
use sleepwalk_runtime::{SessionOutcome, ShutdownSignal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sleepwalkerd")]
#[command(about = "Wanders your folders while you are away and writes down what it dreamt")]
struct Cli {
    /// Directory to explore; repeat for several. Defaults to ~/Desktop and ~/Documents.
    #[arg(long = "dir", value_name = "DIR")]
    dirs: Vec<PathBuf>,
    /// Seconds without input before a session starts exploring.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_IDLE_THRESHOLD.as_secs())]
    idle_timeout: u64,
    #[arg(long, default_value = "dream")]
    mode: ExperienceMode,
    /// Defaults to ~/.sleepwalker/dreams.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Command that reads a prompt on stdin and prints a narrative.
    #[arg(long, value_name = "CMD")]
    generator_cmd: Option<String>,
    #[arg(long = "generator-arg", value_name = "ARG", allow_hyphen_values = true)]
    generator_args: Vec<String>,
    /// Extra environment variables forwarded to the generator command.
    #[arg(long = "generator-env", value_name = "NAME")]
    generator_env: Vec<String>,
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    generation_timeout: u64,
    #[arg(long)]
    no_wake_lock: bool,
    /// Keep only the newest N artifacts of the chosen mode.
    #[arg(long, value_name = "N")]
    retain: Option<usize>,
    #[arg(long, value_name = "N", default_value_t = 100)]
    max_discoveries: usize,
    /// Run a single session instead of dreaming until interrupted.
    #[arg(long)]
    once: bool,
    /// Pause between sessions in continuous mode.
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    rest: u64,
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn default_dirs(home: &Path) -> Vec<PathBuf> {
    ["Desktop", "Documents"]
        .into_iter()
        .map(|name| home.join(name))
        .filter(|dir| dir.is_dir())
        .collect()
}

fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let home = home_dir();
    let dirs = if cli.dirs.is_empty() {
        home.as_deref().map(default_dirs).unwrap_or_default()
    } else {
        cli.dirs.clone()
    };
    if dirs.is_empty() {
        bail!("no directories to explore; pass --dir <DIR>");
    }
    let output_dir = match (&cli.output_dir, &home) {
        (Some(output_dir), _) => output_dir.clone(),
        (None, Some(home)) => home.join(DEFAULT_OUTPUT_DIR),
        (None, None) => PathBuf::from(DEFAULT_OUTPUT_DIR),
    };

    let tuning = SessionTuning::default()
        .max_discoveries(Some(cli.max_discoveries))
        .retain_artifacts(cli.retain);
    SessionConfig::builder(dirs)
        .idle_threshold(Duration::from_secs(cli.idle_timeout))
        .experience_mode(cli.mode)
        .output_dir(output_dir)
        .tuning(tuning)
        .build()
        .context("invalid sleepwalker configuration")
}

fn generator(cli: &Cli) -> Arc<dyn TextGenerator> {
    match &cli.generator_cmd {
        Some(program) => Arc::new(
            CommandGenerator::new(program.clone(), cli.generator_args.clone())
                .pass_env(&cli.generator_env)
                .limits(GeneratorLimits {
                    max_runtime_secs: cli.generation_timeout,
                    ..GeneratorLimits::default()
                }),
        ),
        None => Arc::new(UnavailableGenerator::new(
            "no --generator-cmd given, narratives will be deterministic",
        )),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let cli = Cli::parse();
    let config = session_config(&cli)?;

    let activity = Arc::new(ManualActivity::new());
    let shutdown = ShutdownSignal::new();
    let mut builder = SleepwalkerBuilder::new(config)
        .generator(generator(&cli))
        .generation_policy(
            GenerationPolicy::default()
                .timeout(Duration::from_secs(cli.generation_timeout.max(1) + 1)),
        )
        .activity(activity.clone())
        .shutdown(shutdown.clone());
    if cli.no_wake_lock {
        builder = builder.wake_lock_provider(Arc::new(NoopWakeLock));
    }
    let sleepwalker = builder.build();

    if !sleepwalker.registry().is_available(cli.mode) {
        eprintln!(
            "{} mode is coming soon. Only dream mode can run today.",
            cli.mode
        );
        return Ok(ExitCode::from(2));
    }

    {
        let activity = activity.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "cannot listen for ctrl-c");
                return;
            }
            info!("interrupt received, waking up");
            activity.record_activity();
            shutdown.request();
        });
    }

    let roots: Vec<_> = sleepwalker
        .config()
        .allowed_roots()
        .iter()
        .map(|root| root.display().to_string())
        .collect();
    info!(
        mode = %cli.mode,
        roots = %roots.join(", "),
        output_dir = %sleepwalker.config().output_dir().display(),
        idle_timeout_secs = cli.idle_timeout,
        "sleepwalker started"
    );

    let mut cycle = 1_u64;
    let mut artifacts = 0_u64;
    loop {
        match sleepwalker.run_once().await {
            Ok(SessionOutcome::Completed(report)) => {
                artifacts += 1;
                info!(
                    cycle,
                    artifact = %report.artifact.display(),
                    observations = report.result.observation_count,
                    narrative_source = report.result.narrative_source.as_str(),
                    "session complete"
                );
                let rendered = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_owned());
                debug!(report = %rendered, "session report");
            }
            Ok(SessionOutcome::Cancelled(Some(report))) => {
                artifacts += 1;
                info!(
                    cycle,
                    artifact = %report.artifact.display(),
                    observations = report.result.observation_count,
                    "session interrupted, partial artifact written"
                );
            }
            Ok(SessionOutcome::Cancelled(None)) => {
                info!(cycle, "session cancelled before anything was collected");
            }
            Err(error) if error.is_fatal() => {
                return Err(error).context("sleepwalk session failed");
            }
            Err(error) => warn!(cycle, %error, "session degraded"),
        }

        if cli.once || shutdown.is_requested() {
            break;
        }
        info!(rest_secs = cli.rest, "resting before the next exploration");
        tokio::select! {
            _ = shutdown.requested() => break,
            _ = tokio::time::sleep(Duration::from_secs(cli.rest)) => {}
        }
        cycle += 1;
    }

    info!(
        sessions = cycle,
        artifacts,
        wake_lock_activations = sleepwalker.wake_lock().stats().activation_count,
        "sleepwalker shutting down"
    );
    Ok(ExitCode::SUCCESS)
}
