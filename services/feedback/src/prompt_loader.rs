use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Key of the template that replaces the interviewer's behavior section.
pub const INTERVIEWER_PROMPT: &str = "interviewer";

/// Reads every `*.md` file in `dir_path`, keyed by file stem.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

/// Like `load_prompts`, but a missing directory just means no overrides.
pub fn load_overrides(dir_path: &Path) -> Result<HashMap<String, String>> {
    if !dir_path.exists() {
        tracing::info!(
            "No prompts directory at {}, using built-in prompts",
            dir_path.display()
        );
        return Ok(HashMap::new());
    }
    load_prompts(dir_path)
}

/// The interviewer behavior override, if one was provided and is not blank.
pub fn interviewer_behavior(prompts: &HashMap<String, String>) -> Option<&str> {
    prompts
        .get(INTERVIEWER_PROMPT)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
}
