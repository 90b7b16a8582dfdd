//! Shared domain types used across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Negotiated audio format for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Compressed Opus packets.
    Opus,
    /// Raw PCM, 16-bit little-endian, 16 kHz mono.
    Pcm,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::Opus
    }
}

/// How listening is driven on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// VAD decides speech boundaries.
    Auto,
    /// The client sends explicit listen start/stop.
    Manual,
    /// VAD-driven with barge-in always allowed.
    Realtime,
}

impl Default for ListenMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Why an utterance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// Elapsed silence since the last voiced frame crossed the threshold.
    SilenceDuration { ms: u64 },
    /// Consecutive unvoiced frames crossed the threshold.
    ConsecutiveSilence { frames: u32 },
    /// The independent 1 s silence watchdog fired.
    WatchdogSilence,
    /// The post-voice 1 s guard fired after a voiced run ended.
    PostVoiceSilence,
    /// The client sent `listen stop` in manual mode.
    ListenStop,
    /// The turn was aborted before completion.
    Aborted,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SilenceDuration { ms } => write!(f, "vad:silence_ms(ms={ms})"),
            Self::ConsecutiveSilence { frames } => {
                write!(f, "vad:consecutive_false(false={frames})")
            }
            Self::WatchdogSilence => write!(f, "watchdog_silence_1s"),
            Self::PostVoiceSilence => write!(f, "post_voice_silence_1s"),
            Self::ListenStop => write!(f, "listen_stop"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// A recognized utterance, optionally attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub speaker: Option<String>,
}

impl Transcript {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            speaker: None,
        }
    }

    /// True when there is nothing worth sending downstream.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A completed utterance handed to the recognition dispatcher.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub session_id: String,
    pub utterance_seq: u64,
    pub pcm: Vec<u8>,
    /// When the wake (first voiced frame) was observed.
    pub started_at: std::time::Instant,
    /// When the flush fired.
    pub ended_at: std::time::Instant,
    pub stop_cause: StopCause,
}

impl Utterance {
    pub fn duration(&self) -> std::time::Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}
