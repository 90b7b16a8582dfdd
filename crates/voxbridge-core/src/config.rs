//! Configuration loading and validation.
//!
//! Config is a JSON5 file with `${ENV_VAR}` substitution applied before
//! parsing. Every threshold the pipeline consumes is a typed field with a
//! serde default, so an empty file yields a runnable server. Reload happens
//! between sessions: the gateway swaps its `Arc<Config>` snapshot and
//! in-flight sessions keep the one they started with.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{AudioFormat, ListenMode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub vad: VadConfig,

    #[serde(default)]
    pub eos: EosConfig,

    #[serde(default)]
    pub dialog: DialogConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub firmware: FirmwareConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path devices connect to.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Public base URL advertised in provisioning responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Seconds without a voiced frame before the connection is closed.
    #[serde(default = "default_no_voice_close_secs")]
    pub close_connection_no_voice_time: u64,

    /// WebSocket ping cadence in seconds.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_path() -> String {
    "/xiaozhi/v1/".into()
}

fn default_no_voice_close_secs() -> u64 {
    120
}

fn default_ping_interval_secs() -> u64 {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            ws_path: default_ws_path(),
            public_url: None,
            close_connection_no_voice_time: default_no_voice_close_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Static bearer tokens: token value -> principal name.
    #[serde(default)]
    pub tokens: Vec<StaticToken>,

    /// Device ids allowed to skip token checks entirely.
    #[serde(default)]
    pub allowed_devices: Vec<String>,

    /// Secret for signed-token verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret_env: Option<String>,
}

impl AuthConfig {
    pub fn resolve_signing_secret(&self) -> Option<String> {
        resolve_secret_field(&self.signing_secret, &self.signing_secret_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Default inbound format before hello negotiation.
    #[serde(default)]
    pub format: AudioFormat,

    /// Packets at or below this size are DTX markers.
    #[serde(default = "default_dtx_threshold")]
    pub dtx_threshold_bytes: usize,

    /// Sample rate the Opus decoder is opened at. When this differs from
    /// 16 kHz the decoder output is downmixed and resampled.
    #[serde(default = "default_decoder_rate")]
    pub decoder_sample_rate: u32,

    #[serde(default = "default_decoder_channels")]
    pub decoder_channels: u16,
}

fn default_dtx_threshold() -> usize {
    3
}

fn default_decoder_rate() -> u32 {
    16_000
}

fn default_decoder_channels() -> u16 {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            dtx_threshold_bytes: default_dtx_threshold(),
            decoder_sample_rate: default_decoder_rate(),
            decoder_channels: default_decoder_channels(),
        }
    }
}

/// Which VAD variant runs, and its thresholds. Selection is static per
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default)]
    pub engine: VadEngineKind,

    /// Model variant: voiced at or above this speech probability.
    #[serde(default = "default_th_high")]
    pub threshold: f32,

    /// Model variant: unvoiced at or below this; in between inherits the
    /// previous classification.
    #[serde(default = "default_th_low")]
    pub threshold_low: f32,

    /// Energy variant: integrator level that opens the gate.
    #[serde(default = "default_gate_on")]
    pub gate_on: f64,

    /// Energy variant: gate close level. Unset means gate_on - 4 dB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_off: Option<f64>,

    /// Energy variant: leaky-integrator time constant.
    #[serde(default = "default_tau_ms")]
    pub tau_ms: f64,

    /// Energy variant: noise-floor calibration window.
    #[serde(default = "default_calibration_ms")]
    pub calibration_ms: u64,

    /// Sliding-window length in frames.
    #[serde(default = "default_window_frames")]
    pub window_frames: usize,

    /// Voiced votes required within the window.
    #[serde(default = "default_window_threshold")]
    pub frame_window_threshold: usize,
}

fn default_th_high() -> f32 {
    0.5
}

fn default_th_low() -> f32 {
    0.2
}

fn default_gate_on() -> f64 {
    200.0
}

fn default_tau_ms() -> f64 {
    250.0
}

fn default_calibration_ms() -> u64 {
    800
}

fn default_window_frames() -> usize {
    5
}

fn default_window_threshold() -> usize {
    2
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            engine: VadEngineKind::default(),
            threshold: default_th_high(),
            threshold_low: default_th_low(),
            gate_on: default_gate_on(),
            gate_off: None,
            tau_ms: default_tau_ms(),
            calibration_ms: default_calibration_ms(),
            window_frames: default_window_frames(),
            frame_window_threshold: default_window_threshold(),
        }
    }
}

impl VadConfig {
    /// Effective gate-off level: configured, or gate_on lowered by 4 dB.
    pub fn effective_gate_off(&self) -> f64 {
        self.gate_off
            .unwrap_or(self.gate_on / 10f64.powf(4.0 / 20.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadEngineKind {
    #[default]
    Energy,
    Model,
}

/// End-of-speech thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EosConfig {
    /// EoS suppression window after wake.
    #[serde(default = "default_wake_guard_ms")]
    pub wake_guard_ms: u64,

    /// Minimum spacing between last-voice timestamp refreshes.
    #[serde(default = "default_voice_debounce_ms")]
    pub voice_debounce_ms: u64,

    /// Consecutive unvoiced frames that end an utterance.
    #[serde(default = "default_silence_false_frames")]
    pub silence_false_frames: u32,

    /// Elapsed silence that ends an utterance.
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_duration_ms: u64,

    /// Independent backstop: force EoS this long after the last voiced
    /// frame, regardless of counter state.
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_silence_ms: u64,

    /// Voice-end guard scheduled on the voiced -> silence transition.
    #[serde(default = "default_post_voice_ms")]
    pub post_voice_silence_ms: u64,

    /// Utterances smaller than this are not flushed.
    #[serde(default = "default_min_pcm_bytes")]
    pub min_pcm_bytes: usize,
}

fn default_wake_guard_ms() -> u64 {
    300
}

fn default_voice_debounce_ms() -> u64 {
    100
}

fn default_silence_false_frames() -> u32 {
    10
}

fn default_min_silence_ms() -> u64 {
    700
}

fn default_watchdog_ms() -> u64 {
    1000
}

fn default_post_voice_ms() -> u64 {
    1000
}

fn default_min_pcm_bytes() -> usize {
    12_000
}

impl Default for EosConfig {
    fn default() -> Self {
        Self {
            wake_guard_ms: default_wake_guard_ms(),
            voice_debounce_ms: default_voice_debounce_ms(),
            silence_false_frames: default_silence_false_frames(),
            min_silence_duration_ms: default_min_silence_ms(),
            watchdog_silence_ms: default_watchdog_ms(),
            post_voice_silence_ms: default_post_voice_ms(),
            min_pcm_bytes: default_min_pcm_bytes(),
        }
    }
}

/// Dialog and synthesis behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    #[serde(default)]
    pub listen_mode: ListenMode,

    /// Whether user speech interrupts an in-progress reply.
    #[serde(default = "default_true")]
    pub barge_in: bool,

    /// Barge-in is ignored this long after TTS start.
    #[serde(default = "default_tts_start_lock_ms")]
    pub tts_start_lock_ms: u64,

    /// Provider timeouts for transcription and identification.
    #[serde(default = "default_recognition_timeout_secs")]
    pub recognition_timeout_secs: u64,

    /// Streaming providers must produce a chunk within this window.
    #[serde(default = "default_chunk_idle_timeout_secs")]
    pub chunk_idle_timeout_secs: u64,

    /// How far ahead of real time outbound audio may run.
    #[serde(default = "default_pacing_lead_ms")]
    pub pacing_lead_ms: u64,

    /// Synthesized-character budget per connection. 0 = unlimited.
    #[serde(default)]
    pub max_output_chars: u64,
}

fn default_true() -> bool {
    true
}

fn default_tts_start_lock_ms() -> u64 {
    1200
}

fn default_recognition_timeout_secs() -> u64 {
    15
}

fn default_chunk_idle_timeout_secs() -> u64 {
    30
}

fn default_pacing_lead_ms() -> u64 {
    500
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            listen_mode: ListenMode::default(),
            barge_in: default_true(),
            tts_start_lock_ms: default_tts_start_lock_ms(),
            recognition_timeout_secs: default_recognition_timeout_secs(),
            chunk_idle_timeout_secs: default_chunk_idle_timeout_secs(),
            pacing_lead_ms: default_pacing_lead_ms(),
            max_output_chars: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub transcription: TranscriptionConfig,

    /// Speaker identification is optional; unset disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<SpeakerIdConfig>,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub intent: IntentConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq" or "openai".
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerIdConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl SpeakerIdConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            api_key_env: None,
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider: "elevenlabs" or "openai".
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            voice: None,
            model: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Phrases that end the conversation when they make up the whole
    /// utterance.
    #[serde(default = "default_exit_phrases")]
    pub exit_phrases: Vec<String>,

    #[serde(default = "default_farewell")]
    pub farewell: String,
}

fn default_exit_phrases() -> Vec<String> {
    vec!["goodbye".into(), "bye now".into(), "exit".into()]
}

fn default_farewell() -> String {
    "Goodbye!".into()
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            exit_phrases: default_exit_phrases(),
            farewell: default_farewell(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Exchanges kept per session when building LLM context.
    #[serde(default = "default_history_turns")]
    pub max_history_turns: usize,
}

fn default_history_turns() -> usize {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_history_turns(),
        }
    }
}

/// Firmware metadata advertised by the provisioning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    #[serde(default = "default_firmware_version")]
    pub version: String,

    #[serde(default)]
    pub url: String,
}

fn default_firmware_version() -> String {
    "1.6.8".into()
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            version: default_firmware_version(),
            url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxbridge_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
        }
    }
}

/// Resolve a secret: check the direct value first, then the env-var
/// reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns with their environment values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::VoxbridgeError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::VoxbridgeError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Get a config value by dotted path (e.g. "server.port").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port cannot be 0".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/': {}",
                self.server.ws_path
            ));
        }

        if self.auth.enabled
            && self.auth.tokens.is_empty()
            && self.auth.allowed_devices.is_empty()
            && self.auth.resolve_signing_secret().is_none()
        {
            errors.push(
                "auth.enabled is set but no tokens, allowed devices, or signing secret are configured"
                    .to_string(),
            );
        }

        if self.providers.transcription.resolve_api_key().is_none() {
            warnings.push("transcription provider has no API key configured".to_string());
        }
        if self.providers.llm.resolve_api_key().is_none() {
            warnings.push("LLM provider has no API key configured".to_string());
        }
        if self.providers.tts.resolve_api_key().is_none() {
            warnings.push("TTS provider has no API key configured".to_string());
        }

        if self.vad.frame_window_threshold > self.vad.window_frames {
            errors.push(format!(
                "vad.frame_window_threshold ({}) exceeds vad.window_frames ({})",
                self.vad.frame_window_threshold, self.vad.window_frames
            ));
        }
        if self.vad.threshold_low > self.vad.threshold {
            errors.push("vad.threshold_low must not exceed vad.threshold".to_string());
        }

        if self.eos.min_pcm_bytes == 0 {
            warnings.push("eos.min_pcm_bytes is 0: truncated clips will reach transcription".into());
        }

        (warnings, errors)
    }
}
