use std::path::PathBuf;

/// One line typed at the feedback prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    Audio(PathBuf),
    Summary,
    Done,
    Cancel,
    Help,
    Unknown(String),
    Empty,
}

pub const HELP: &str = "Type your feedback and press enter. Commands:
  /audio <path>  send a recorded clip instead of text
  /summary       show the feedback captured so far
  /done          finish the conversation and review the feedback
  /cancel        abandon the session
  /help          show this message";

pub fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Say(line.to_string());
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));

    match (name.to_lowercase().as_str(), rest) {
        ("audio", path) if !path.is_empty() => ReplCommand::Audio(PathBuf::from(path)),
        ("summary", _) => ReplCommand::Summary,
        ("done", _) => ReplCommand::Done,
        ("cancel", _) => ReplCommand::Cancel,
        ("help", _) => ReplCommand::Help,
        _ => ReplCommand::Unknown(line.to_string()),
    }
}

/// Reads a keep/drop answer. Items are kept unless the reviewer says no.
pub fn parse_decision(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "" | "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
