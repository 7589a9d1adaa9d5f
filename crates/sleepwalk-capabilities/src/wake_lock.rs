use std::io::ErrorKind;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use sleepwalk_protocol::{SleepwalkError, SleepwalkResult, WakeLockProvider};
use tracing::{debug, info, warn};

/// Holds sleep off for as long as an inhibitor child process is alive.
#[derive(Debug)]
pub struct CommandWakeLock {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl CommandWakeLock {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: Mutex::new(None),
        }
    }

    /// `caffeinate` on macOS, `systemd-inhibit` on Linux, nothing elsewhere.
    pub fn platform_default() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Self::new("caffeinate", vec!["-dims".to_owned()]))
        } else if cfg!(target_os = "linux") {
            Some(Self::new(
                "systemd-inhibit",
                [
                    "--what=idle:sleep",
                    "--who=sleepwalker",
                    "--why=Sleepwalk session in progress",
                    "--mode=block",
                    "sleep",
                    "infinity",
                ]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            ))
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.child.lock().is_some()
    }
}

impl WakeLockProvider for CommandWakeLock {
    fn name(&self) -> &str {
        &self.program
    }

    fn begin(&self) -> SleepwalkResult<()> {
        let mut slot = self.child.lock();
        if slot.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| {
                let reason = match error.kind() {
                    ErrorKind::NotFound => "inhibitor not installed".to_owned(),
                    _ => error.to_string(),
                };
                SleepwalkError::WakeLockUnavailable(format!("{}: {reason}", self.program))
            })?;

        // An inhibitor that dies on startup (no session bus, denied by
        // policy) leaves nothing to hold.
        if let Ok(Some(status)) = child.try_wait() {
            return Err(SleepwalkError::WakeLockUnavailable(format!(
                "{} exited immediately with {status}",
                self.program
            )));
        }

        info!(program = %self.program, pid = child.id(), "sleep inhibitor started");
        *slot = Some(child);
        Ok(())
    }

    fn end(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        let pid = child.id();
        if let Err(error) = child.kill() {
            debug!(pid, error = %error, "sleep inhibitor already gone");
        }
        match child.wait() {
            Ok(status) => info!(program = %self.program, pid, %status, "sleep inhibitor stopped"),
            Err(error) => warn!(program = %self.program, pid, error = %error, "sleep inhibitor not reaped"),
        }
    }
}

impl Drop for CommandWakeLock {
    fn drop(&mut self) {
        self.end();
    }
}

/// Provider for platforms (or runs) without sleep inhibition.
#[derive(Debug, Clone, Default)]
pub struct NoopWakeLock;

impl WakeLockProvider for NoopWakeLock {
    fn name(&self) -> &str {
        "noop"
    }

    fn begin(&self) -> SleepwalkResult<()> {
        debug!("sleep inhibition disabled");
        Ok(())
    }

    fn end(&self) {}
}
