use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sleepwalk_protocol::{SleepwalkError, SleepwalkResult, TextGenerator};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

/// Environment variables a generator command inherits by default.
pub const DEFAULT_ENV_ALLOW_LIST: [&str; 5] = ["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorLimits {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for GeneratorLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 60,
            max_output_bytes: 16 * 1024,
        }
    }
}

/// Runs an external command per generation: prompt on stdin, narrative on
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    limits: GeneratorLimits,
}

impl CommandGenerator {
    /// The child sees only the variables in [`DEFAULT_ENV_ALLOW_LIST`] that
    /// are set in the current process.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            limits: GeneratorLimits::default(),
        }
        .pass_env(DEFAULT_ENV_ALLOW_LIST)
    }

    /// Forwards additional variables (API keys, model selection) from the
    /// current environment.
    pub fn pass_env<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref();
            if let Ok(value) = std::env::var(name) {
                self.env.insert(name.to_owned(), value);
            }
        }
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn limits(mut self, limits: GeneratorLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn truncate(output: Vec<u8>, max_output_bytes: usize) -> String {
        let mut output = output;
        if output.len() > max_output_bytes {
            output.truncate(max_output_bytes);
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    async fn run(&self, prompt: &str) -> SleepwalkResult<std::process::Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| match error.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                SleepwalkError::GenerationUnavailable(format!("{}: {error}", self.program))
            }
            _ => SleepwalkError::GenerationFailed(format!("{}: {error}", self.program)),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close the pipe early.
            if let Err(error) = stdin.write_all(prompt.as_bytes()).await {
                debug!(error = %error, "generator closed stdin before reading the prompt");
            }
        }

        child
            .wait_with_output()
            .await
            .map_err(|error| SleepwalkError::GenerationFailed(error.to_string()))
    }
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(
        skip(self, prompt),
        fields(program = %self.program, args_count = self.args.len(), prompt_len = prompt.len())
    )]
    async fn generate(&self, prompt: &str) -> SleepwalkResult<String> {
        let started_at = Utc::now();
        let limit = Duration::from_secs(self.limits.max_runtime_secs.max(1));

        let output = match timeout(limit, self.run(prompt)).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    max_runtime_secs = self.limits.max_runtime_secs,
                    "generator command timed out"
                );
                return Err(SleepwalkError::GenerationTimedOut {
                    after_ms: limit.as_millis() as u64,
                });
            }
        };

        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(exit_code, duration_ms, "generator command finished");

        if !output.status.success() {
            let stderr = Self::truncate(output.stderr, self.limits.max_output_bytes);
            return Err(SleepwalkError::GenerationFailed(format!(
                "{} exited with {exit_code}: {}",
                self.program,
                stderr.trim()
            )));
        }
        Ok(Self::truncate(output.stdout, self.limits.max_output_bytes))
    }
}

/// Generator for setups without a backend; every session degrades to the
/// deterministic narrative.
#[derive(Debug, Clone)]
pub struct UnavailableGenerator {
    reason: String,
}

impl UnavailableGenerator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableGenerator {
    fn default() -> Self {
        Self::new("no text generator configured")
    }
}

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn generate(&self, _prompt: &str) -> SleepwalkResult<String> {
        Err(SleepwalkError::GenerationUnavailable(self.reason.clone()))
    }
}
