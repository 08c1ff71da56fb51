use crate::interviewer::DEFAULT_API_BASE;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// Whisper rejects uploads above 25 MiB.
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Turns recorded speech into text.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `file_name` carries the container format (e.g. `clip.webm`).
    async fn transcribe(&self, audio: &[u8], file_name: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes audio with the OpenAI transcription endpoint.
pub struct WhisperTranscriber {
    client: Client,
    api_key: SecretString,
    model: String,
    api_base: String,
}

impl WhisperTranscriber {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], file_name: &str) -> Result<String> {
        if audio.len() > MAX_AUDIO_BYTES {
            anyhow::bail!(
                "Audio is {} bytes, the limit is {} bytes",
                audio.len(),
                MAX_AUDIO_BYTES
            );
        }

        let part = Part::bytes(audio.to_vec()).file_name(file_name.to_string());
        let form = Form::new()
            .text("model", self.model.clone())
            .text("language", "en")
            .part("file", part);

        let resp = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json::<TranscriptionResponse>()
            .await?;

        Ok(resp.text.trim().to_string())
    }
}

/// Stands in for a speech-to-text service when none is configured.
#[derive(Debug, Default, Clone)]
pub struct OfflineTranscriber;

#[async_trait]
impl Transcriber for OfflineTranscriber {
    async fn transcribe(&self, audio: &[u8], file_name: &str) -> Result<String> {
        if audio.is_empty() {
            anyhow::bail!("Audio clip {file_name} is empty");
        }
        Ok(format!(
            "[Offline transcription of {file_name}] This is a sample transcription of {} bytes of audio.",
            audio.len()
        ))
    }
}
