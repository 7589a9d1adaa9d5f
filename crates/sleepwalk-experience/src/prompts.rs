//! Prompt construction for narrative generation.

use sleepwalk_protocol::{DiscoveryKind, Observation};

pub const DREAM_PROMPT_TEMPLATE: &str = "Digital sleepwalking. These files trigger dream memories:

{observations}

Write 2 tiny paragraphs. Each 2-3 sentences max. Use content previews for surreal
connections.";

const EMPTY_OBSERVATIONS: &str = "(No recent discoveries)";

/// Grounds the dream prompt in what was actually found: kind, name, size,
/// modification date, and preview of each observation.
pub fn format_dream_prompt(observations: &[Observation]) -> String {
    if observations.is_empty() {
        return DREAM_PROMPT_TEMPLATE.replace("{observations}", EMPTY_OBSERVATIONS);
    }

    let details = observations
        .iter()
        .map(observation_line)
        .collect::<Vec<_>>()
        .join("\n");
    DREAM_PROMPT_TEMPLATE.replace("{observations}", &details)
}

fn observation_line(observation: &Observation) -> String {
    let kind = match observation.kind {
        DiscoveryKind::File => "File",
        DiscoveryKind::Directory => "Directory",
    };
    let mut line = format!("- {kind}: {}", observation.name);
    if observation.kind == DiscoveryKind::File {
        line.push_str(&format!(" ({} bytes)", observation.size_bytes));
    }
    line.push_str(&format!(
        " modified {}",
        observation.modified_at.format("%Y-%m-%d")
    ));
    if let Some(preview) = &observation.preview {
        line.push_str(&format!("\n  Content preview: {preview}"));
    }
    line
}
