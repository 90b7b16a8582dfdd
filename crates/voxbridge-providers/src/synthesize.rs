//! Streaming text-to-speech.
//!
//! The pipeline consumes raw PCM16LE at 16 kHz mono. ElevenLabs streams
//! that directly with `output_format: pcm_16000`; the OpenAI speech
//! endpoint streams 24 kHz PCM, which is resampled on the way through.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use voxbridge_core::config::TtsConfig;
use voxbridge_media::resample::LinearResampler;
use voxbridge_media::{SAMPLE_RATE, bytes_to_samples, samples_to_bytes};

use crate::{AudioStream, SynthesisProvider};

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: Option<String>,
    voice: String,
    model: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(client: reqwest::Client, cfg: &TtsConfig) -> Self {
        Self {
            client,
            api_key: cfg.resolve_api_key(),
            voice: cfg.voice.clone().unwrap_or_else(|| "Rachel".into()),
            model: cfg.model.clone().unwrap_or_else(|| "eleven_turbo_v2".into()),
        }
    }
}

/// Build the streaming TTS request URL for a given voice.
pub fn build_tts_url(voice: &str) -> String {
    format!("https://api.elevenlabs.io/v1/text-to-speech/{voice}/stream")
}

#[async_trait]
impl SynthesisProvider for ElevenLabsSynthesizer {
    async fn stream_speech(&self, text: &str) -> anyhow::Result<AudioStream> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        debug!(voice = %self.voice, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(build_tts_url(&self.voice))
            .header("xi-api-key", api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
                "output_format": "pcm_16000",
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| match chunk {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(e) => Err(anyhow::anyhow!("TTS stream error: {e}")),
            });

        Ok(Box::pin(stream))
    }
}

/// OpenAI speech endpoint. `response_format: "pcm"` is 24 kHz mono
/// PCM16LE, so the stream carries a resampler down to the pipeline rate.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: Option<String>,
    voice: String,
    model: String,
}

/// Sample rate of the OpenAI speech endpoint's raw PCM output.
const OPENAI_PCM_RATE: u32 = 24_000;

pub const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

impl OpenAiSynthesizer {
    pub fn new(client: reqwest::Client, cfg: &TtsConfig) -> Self {
        Self {
            client,
            api_key: cfg.resolve_api_key(),
            voice: cfg.voice.clone().unwrap_or_else(|| "alloy".into()),
            model: cfg.model.clone().unwrap_or_else(|| "tts-1".into()),
        }
    }
}

#[async_trait]
impl SynthesisProvider for OpenAiSynthesizer {
    async fn stream_speech(&self, text: &str) -> anyhow::Result<AudioStream> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;

        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(OPENAI_SPEECH_URL)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
                "voice": self.voice,
                "response_format": "pcm",
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        // resampler state and any odd trailing byte carry across chunks
        let stream = resp.bytes_stream().scan(
            (LinearResampler::new(OPENAI_PCM_RATE, SAMPLE_RATE), Vec::new()),
            |(resampler, carry), chunk| {
                let item = match chunk {
                    Ok(bytes) => Ok(downsample_chunk(resampler, carry, &bytes)),
                    Err(e) => Err(anyhow::anyhow!("TTS stream error: {e}")),
                };
                futures::future::ready(Some(item))
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Convert one 24 kHz PCM chunk to 16 kHz, keeping interpolation state
/// and partial samples continuous across chunk boundaries.
fn downsample_chunk(resampler: &mut LinearResampler, carry: &mut Vec<u8>, bytes: &[u8]) -> Vec<u8> {
    carry.extend_from_slice(bytes);
    let usable = carry.len() - (carry.len() % 2);
    let samples = bytes_to_samples(&carry[..usable]);
    carry.drain(..usable);
    samples_to_bytes(&resampler.resample(&samples))
}
