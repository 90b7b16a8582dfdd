//! Whisper-style transcription over multipart upload.

use async_trait::async_trait;
use tracing::debug;

use voxbridge_core::config::TranscriptionConfig;

use crate::TranscriptionProvider;

/// Get the transcription API URL for a given provider.
pub fn provider_url(provider: &str) -> &'static str {
    match provider {
        "openai" => "https://api.openai.com/v1/audio/transcriptions",
        _ => "https://api.groq.com/openai/v1/audio/transcriptions",
    }
}

pub struct HttpTranscriber {
    client: reqwest::Client,
    url: &'static str,
    api_key: Option<String>,
    model: String,
}

impl HttpTranscriber {
    pub fn new(client: reqwest::Client, cfg: &TranscriptionConfig) -> Self {
        Self {
            client,
            url: provider_url(&cfg.provider),
            api_key: cfg.resolve_api_key(),
            model: cfg
                .model
                .clone()
                .unwrap_or_else(|| "whisper-large-v3-turbo".into()),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for HttpTranscriber {
    async fn transcribe(&self, wav: Vec<u8>, session_id: &str) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;

        debug!(session_id, wav_bytes = wav.len(), model = %self.model, "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(self.url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_url_selection() {
        assert!(provider_url("groq").contains("groq.com"));
        assert!(provider_url("openai").contains("openai.com"));
        // unknown providers fall back to groq
        assert!(provider_url("other").contains("groq.com"));
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let provider =
            HttpTranscriber::new(reqwest::Client::new(), &TranscriptionConfig::default());
        let err = provider.transcribe(vec![0u8; 44], "s1").await.unwrap_err();
        assert!(err.to_string().contains("API key"));
    }
}
