//! Deterministic provider fakes for pipeline and gateway tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use voxbridge_core::config::{IntentConfig, MemoryConfig};

use crate::{
    AudioStream, ChatMessage, LlmProvider, ProviderSet, SpeakerIdProvider, SynthesisProvider,
    TextStream, TranscriptionProvider, intent::FarewellIntent, memory::InMemoryDialog,
};

/// Returns a scripted transcript, optionally after a delay (for timeout
/// tests).
pub struct FakeTranscriber {
    pub text: String,
    pub delay: Option<Duration>,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            text: text.into(),
            delay: None,
        }
    }

    pub fn stalled(delay: Duration) -> Self {
        Self {
            text: "late".into(),
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for FakeTranscriber {
    async fn transcribe(&self, _wav: Vec<u8>, _session_id: &str) -> anyhow::Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.text.clone())
    }
}

pub struct FakeSpeakerId {
    pub label: Option<String>,
    pub delay: Option<Duration>,
}

#[async_trait]
impl SpeakerIdProvider for FakeSpeakerId {
    async fn identify(&self, _wav: Vec<u8>, _session_id: &str) -> anyhow::Result<Option<String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.label.clone())
    }
}

/// Streams a fixed set of reply chunks, optionally spaced out in time.
pub struct FakeLlm {
    pub chunks: Vec<String>,
    pub delay_between: Option<Duration>,
}

impl FakeLlm {
    pub fn saying(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            delay_between: None,
        }
    }

    pub fn slowly(chunks: &[&str], delay: Duration) -> Self {
        Self {
            delay_between: Some(delay),
            ..Self::saying(chunks)
        }
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    async fn stream_chat(&self, _history: &[ChatMessage]) -> anyhow::Result<TextStream> {
        let chunks = self.chunks.clone();
        let delay = self.delay_between;
        let stream = futures::stream::unfold(
            (chunks.into_iter(), delay),
            |(mut chunks, delay)| async move {
                let chunk = chunks.next()?;
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Some((Ok(chunk), (chunks, delay)))
            },
        );
        Ok(Box::pin(stream))
    }
}

/// A failing LLM, for mid-stream error paths.
pub struct BrokenLlm;

#[async_trait]
impl LlmProvider for BrokenLlm {
    async fn stream_chat(&self, _history: &[ChatMessage]) -> anyhow::Result<TextStream> {
        let stream = futures::stream::iter(vec![
            Ok("partial ".to_string()),
            Err(anyhow::anyhow!("stream interrupted")),
        ]);
        Ok(Box::pin(stream))
    }
}

/// Emits `chunks_per_sentence` PCM chunks of `chunk_bytes` zeros per call.
pub struct FakeSynthesizer {
    pub chunks_per_sentence: usize,
    pub chunk_bytes: usize,
}

impl Default for FakeSynthesizer {
    fn default() -> Self {
        Self {
            chunks_per_sentence: 2,
            chunk_bytes: 1920, // 60 ms of 16 kHz mono
        }
    }
}

#[async_trait]
impl SynthesisProvider for FakeSynthesizer {
    async fn stream_speech(&self, _text: &str) -> anyhow::Result<AudioStream> {
        let chunks: Vec<Vec<u8>> = (0..self.chunks_per_sentence)
            .map(|_| vec![0u8; self.chunk_bytes])
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks).map(Ok)))
    }
}

/// Build a fully faked provider set for tests.
pub fn fake_providers(transcript: &str, reply_chunks: &[&str]) -> ProviderSet {
    ProviderSet {
        transcription: Arc::new(FakeTranscriber::returning(transcript)),
        speaker_id: None,
        llm: Arc::new(FakeLlm::saying(reply_chunks)),
        synthesis: Arc::new(FakeSynthesizer::default()),
        intent: Arc::new(FarewellIntent::new(&IntentConfig::default())),
        memory: Arc::new(InMemoryDialog::new(&MemoryConfig::default(), None)),
    }
}
