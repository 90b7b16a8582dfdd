//! Speaker identification against an external voiceprint service.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use voxbridge_core::config::SpeakerIdConfig;

use crate::SpeakerIdProvider;

pub struct HttpSpeakerId {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct IdentifyResponse {
    speaker: Option<String>,
}

impl HttpSpeakerId {
    pub fn new(client: reqwest::Client, cfg: &SpeakerIdConfig) -> Self {
        Self {
            client,
            url: cfg.url.clone(),
            api_key: cfg.resolve_api_key(),
        }
    }
}

#[async_trait]
impl SpeakerIdProvider for HttpSpeakerId {
    async fn identify(&self, wav: Vec<u8>, session_id: &str) -> anyhow::Result<Option<String>> {
        debug!(session_id, wav_bytes = wav.len(), "Sending audio for speaker identification");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("session_id", session_id.to_string())
            .part("file", part);

        let mut req = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Speaker-id API error {status}");
        }

        let body: IdentifyResponse = resp.json().await?;
        Ok(body.speaker.filter(|s| !s.trim().is_empty()))
    }
}
