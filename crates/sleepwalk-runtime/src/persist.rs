//! Narrative artifacts on disk.
//!
//! One markdown file per session, named so that a plain lexical sort is
//! chronological within a mode.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sleepwalk_protocol::{ExperienceMode, SessionId, SessionResult, SleepwalkError, SleepwalkResult};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const ARTIFACT_EXTENSION: &str = "md";

/// `<mode>-<YYYYmmddTHHMMSS.fffZ>-<short id>.md`
pub fn artifact_file_name(mode: ExperienceMode, session_id: &SessionId, at: DateTime<Utc>) -> String {
    format!(
        "{mode}-{}-{}.{ARTIFACT_EXTENSION}",
        at.format("%Y%m%dT%H%M%S%.3fZ"),
        session_id.short()
    )
}

pub fn render_artifact(result: &SessionResult) -> String {
    let outcome = if result.cancelled { "cancelled" } else { "completed" };
    let mut lines = vec![
        format!("# Sleepwalk {} session {}", result.mode, result.session_id),
        String::new(),
        format!("observation_count: {}", result.observation_count),
        format!("outcome: {outcome}"),
        format!("started_at: {}", result.started_at.to_rfc3339()),
        format!("ended_at: {}", result.ended_at.to_rfc3339()),
        format!("narrative_source: {}", result.narrative_source.as_str()),
        "explored_roots:".to_owned(),
    ];
    lines.extend(
        result
            .explored_roots
            .iter()
            .map(|root| format!("  - {}", root.display())),
    );
    lines.push(String::new());
    lines.push("---".to_owned());
    lines.push(String::new());
    lines.push(result.narrative.trim_end().to_owned());

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

fn persistence(path: &Path) -> impl FnOnce(std::io::Error) -> SleepwalkError + '_ {
    move |source| SleepwalkError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes the artifact for `result`, creating `output_dir` if needed. Never
/// overwrites an existing file.
pub async fn write_artifact(output_dir: &Path, result: &SessionResult) -> SleepwalkResult<PathBuf> {
    fs::create_dir_all(output_dir)
        .await
        .map_err(persistence(output_dir))?;

    let path = output_dir.join(artifact_file_name(
        result.mode,
        &result.session_id,
        result.ended_at,
    ));
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .map_err(persistence(&path))?;
    file.write_all(render_artifact(result).as_bytes())
        .await
        .map_err(persistence(&path))?;
    file.flush().await.map_err(persistence(&path))?;

    info!(path = %path.display(), "artifact written");
    Ok(path)
}

/// Deletes the oldest artifacts of `mode` so that at most `keep` remain.
/// Files that do not look like artifacts are left alone.
pub async fn prune_artifacts(
    output_dir: &Path,
    mode: ExperienceMode,
    keep: usize,
) -> SleepwalkResult<usize> {
    let prefix = format!("{mode}-");
    let suffix = format!(".{ARTIFACT_EXTENSION}");

    let mut names = Vec::new();
    let mut entries = fs::read_dir(output_dir)
        .await
        .map_err(persistence(output_dir))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(persistence(output_dir))?
    {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            names.push(name);
        }
    }

    if names.len() <= keep {
        return Ok(0);
    }
    names.sort();
    let excess = names.len() - keep;
    for name in &names[..excess] {
        let path = output_dir.join(name);
        fs::remove_file(&path).await.map_err(persistence(&path))?;
        debug!(path = %path.display(), "old artifact removed");
    }
    Ok(excess)
}
