//! Provider contracts.
//!
//! Each third-party dependency of the pipeline is a narrow behavioral
//! contract so sessions depend on interfaces and tests substitute
//! deterministic fakes. Shared instances are process-scoped and must be
//! safe for concurrent invocation.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use voxbridge_core::config::ProvidersConfig;

pub mod intent;
pub mod memory;
pub mod openai_llm;
pub mod speaker;
pub mod sse;
pub mod synthesize;
pub mod testing;
pub mod transcribe;

/// A lazily produced sequence of reply-text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// A lazily produced sequence of raw PCM16LE 16 kHz mono audio chunks.
pub type AudioStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

/// One entry of dialog history, in the OpenAI message shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Converts one utterance of WAV-packaged audio into text.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>, session_id: &str) -> anyhow::Result<String>;
}

/// Optionally attributes one utterance to a known speaker.
#[async_trait]
pub trait SpeakerIdProvider: Send + Sync {
    async fn identify(&self, wav: Vec<u8>, session_id: &str) -> anyhow::Result<Option<String>>;
}

/// Streams reply text for a dialog history.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn stream_chat(&self, history: &[ChatMessage]) -> anyhow::Result<TextStream>;
}

/// Streams synthesized speech for one sentence of reply text.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn stream_speech(&self, text: &str) -> anyhow::Result<AudioStream>;
}

/// What intent matching decided about a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    /// Not an intent; continue to the language model.
    Pass,
    /// The intent handler consumed the turn.
    Consumed {
        /// Optional fixed reply to synthesize instead of an LLM turn.
        reply: Option<String>,
        close_after_reply: bool,
    },
}

/// Matches transcripts against device intents before the LLM sees them.
#[async_trait]
pub trait IntentProvider: Send + Sync {
    async fn evaluate(&self, text: &str) -> anyhow::Result<IntentOutcome>;
}

/// Per-session dialog history. Implementations synchronize internally.
pub trait MemoryProvider: Send + Sync {
    /// History to send to the LLM, oldest first, including any system
    /// prompt.
    fn history(&self, session_id: &str) -> Vec<ChatMessage>;
    fn append(&self, session_id: &str, role: Role, text: &str);
    fn forget(&self, session_id: &str);
}

/// The full set of provider handles a session consumes. Constructed once
/// per process and shared; see the gateway state for the lazy-init path.
#[derive(Clone)]
pub struct ProviderSet {
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub speaker_id: Option<Arc<dyn SpeakerIdProvider>>,
    pub llm: Arc<dyn LlmProvider>,
    pub synthesis: Arc<dyn SynthesisProvider>,
    pub intent: Arc<dyn IntentProvider>,
    pub memory: Arc<dyn MemoryProvider>,
}

impl ProviderSet {
    /// Build the concrete providers named in config.
    pub fn from_config(cfg: &ProvidersConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();

        let transcription = Arc::new(transcribe::HttpTranscriber::new(
            client.clone(),
            &cfg.transcription,
        ));

        let speaker_id = cfg.speaker_id.as_ref().map(|sc| {
            let provider: Arc<dyn SpeakerIdProvider> =
                Arc::new(speaker::HttpSpeakerId::new(client.clone(), sc));
            provider
        });

        let llm = Arc::new(openai_llm::OpenAiChatProvider::new(client.clone(), &cfg.llm));

        let synthesis: Arc<dyn SynthesisProvider> = match cfg.tts.provider.as_str() {
            "elevenlabs" => Arc::new(synthesize::ElevenLabsSynthesizer::new(client, &cfg.tts)),
            "openai" => Arc::new(synthesize::OpenAiSynthesizer::new(client, &cfg.tts)),
            other => anyhow::bail!("unknown TTS provider: {other}"),
        };

        let intent = Arc::new(intent::FarewellIntent::new(&cfg.intent));
        let memory = Arc::new(memory::InMemoryDialog::new(&cfg.memory, None));

        Ok(Self {
            transcription,
            speaker_id,
            llm,
            synthesis,
            intent,
            memory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: "hi".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
    }

    #[test]
    fn test_from_config_rejects_unknown_tts() {
        let mut cfg = ProvidersConfig::default();
        cfg.tts.provider = "kazoo".into();
        assert!(ProviderSet::from_config(&cfg).is_err());
    }

    #[test]
    fn test_from_config_defaults() {
        let set = ProviderSet::from_config(&ProvidersConfig::default()).unwrap();
        assert!(set.speaker_id.is_none());
    }

    #[test]
    fn test_from_config_openai_tts() {
        let mut cfg = ProvidersConfig::default();
        cfg.tts.provider = "openai".into();
        assert!(ProviderSet::from_config(&cfg).is_ok());
    }
}
