//! Application Configuration Module
//!
//! Loads the feedback service settings from environment variables into a
//! single struct that is built once at startup.

use poem_feedback_core::transcription::MAX_AUDIO_BYTES;
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs the service offline with the scripted interviewer.
    pub openai_api_key: Option<SecretString>,
    pub chat_model: String,
    pub transcription_model: String,
    pub log_level: Level,
    pub prompts_dir: PathBuf,
    pub max_audio_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `OPENAI_API_KEY`: (Optional) Enables the chat-completion interviewer and Whisper transcription.
    // *   `CHAT_MODEL`: (Optional) Model used by the interviewer. Defaults to "gpt-4o".
    // *   `TRANSCRIPTION_MODEL`: (Optional) Model used for audio turns. Defaults to "whisper-1".
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    // *   `PROMPTS_DIR`: (Optional) Directory of `.md` prompt overrides. Defaults to "prompts".
    // *   `MAX_AUDIO_BYTES`: (Optional) Largest accepted audio clip. Defaults to 25 MiB.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. This is useful for local development and is ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);

        let chat_model = lookup("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let transcription_model =
            lookup("TRANSCRIPTION_MODEL").unwrap_or_else(|| "whisper-1".to_string());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        let prompts_dir = lookup("PROMPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("prompts"));

        let max_audio_bytes = match lookup("MAX_AUDIO_BYTES") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "MAX_AUDIO_BYTES",
                    value,
                })?,
            None => MAX_AUDIO_BYTES,
        };

        Ok(Self {
            openai_api_key,
            chat_model,
            transcription_model,
            log_level,
            prompts_dir,
            max_audio_bytes,
        })
    }

    pub fn is_offline(&self) -> bool {
        self.openai_api_key.is_none()
    }
}
