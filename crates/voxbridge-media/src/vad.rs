//! Voice activity detection.
//!
//! Two interchangeable variants, selected statically per process: an
//! energy gate with a leaky integrator and calibrated noise floor, and a
//! Silero model classifier with dual-threshold hysteresis. Both share the
//! 20 ms framing stash, the sliding-window vote, and the silence counters
//! the end-of-speech controller reads.

use std::collections::VecDeque;

use voice_activity_detector::VoiceActivityDetector;

use voxbridge_core::config::{VadConfig, VadEngineKind};

use crate::{FRAME_BYTES, FRAME_SAMPLES, SAMPLE_RATE, bytes_to_samples};

/// Per-frame classification after hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClass {
    /// Raw classification of this frame.
    pub voiced: bool,
    /// Sliding-window vote at this frame.
    pub windowed: bool,
}

/// Result of processing one packet's PCM.
#[derive(Debug)]
pub struct VadVerdict {
    /// Windowed vote held at any frame of this packet.
    pub speech: bool,
    /// Per-frame classifications, in arrival order.
    pub frames: Vec<FrameClass>,
    /// Concatenated bytes of the voiced frames only.
    pub voiced_pcm: Vec<u8>,
}

/// Compute RMS energy of a PCM frame.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

enum VadEngine {
    Energy(EnergyVad),
    Model(ModelVad),
}

impl VadEngine {
    fn classify(&mut self, samples: &[i16]) -> bool {
        match self {
            Self::Energy(e) => e.classify(samples),
            Self::Model(m) => m.classify(samples),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Energy(e) => e.reset(),
            Self::Model(m) => m.reset(),
        }
    }
}

/// RMS gate with hysteresis. A leaky integrator accumulates excess over
/// the noise floor; the floor is the 20th percentile of RMS observed in
/// the initial calibration window and survives per-utterance resets.
struct EnergyVad {
    gate_on: f64,
    gate_off: f64,
    decay: f64,
    acc: f64,
    voiced: bool,
    calib_remaining: usize,
    calib_samples: Vec<f64>,
    noise_floor: Option<f64>,
}

impl EnergyVad {
    fn new(cfg: &VadConfig) -> Self {
        let frame_ms = FRAME_SAMPLES as f64 * 1000.0 / f64::from(SAMPLE_RATE);
        Self {
            gate_on: cfg.gate_on,
            gate_off: cfg.effective_gate_off(),
            decay: (-frame_ms / cfg.tau_ms.max(1.0)).exp(),
            acc: 0.0,
            voiced: false,
            calib_remaining: (cfg.calibration_ms / frame_ms as u64) as usize,
            calib_samples: Vec::new(),
            noise_floor: None,
        }
    }

    fn classify(&mut self, samples: &[i16]) -> bool {
        let level = rms(samples);

        if self.calib_remaining > 0 {
            self.calib_samples.push(level);
            self.calib_remaining -= 1;
            if self.calib_remaining == 0 && !self.calib_samples.is_empty() {
                let mut sorted = std::mem::take(&mut self.calib_samples);
                sorted.sort_by(|a, b| a.total_cmp(b));
                let idx = ((sorted.len() as f64 * 0.2) as usize).saturating_sub(1);
                self.noise_floor = Some(sorted[idx.min(sorted.len() - 1)]);
            }
        }

        let floor = self.noise_floor.unwrap_or(0.0);
        let delta = (level - floor).max(0.0);
        self.acc = self.acc * self.decay + delta;

        if self.acc >= self.gate_on {
            self.voiced = true;
        } else if self.acc <= self.gate_off {
            self.voiced = false;
        }
        self.voiced
    }

    fn reset(&mut self) {
        self.acc = 0.0;
        self.voiced = false;
        // noise floor and calibration progress persist
    }
}

/// Samples the Silero model scores per inference. The model needs at
/// least 32 ms of context at 16 kHz, so each 20 ms frame is scored on a
/// sliding window ending at that frame.
const MODEL_WINDOW_SAMPLES: usize = 512;

/// Silero classifier with dual-threshold hysteresis: in between the two
/// thresholds the previous classification is inherited.
struct ModelVad {
    detector: VoiceActivityDetector,
    context: Vec<i16>,
    th_high: f32,
    th_low: f32,
    voiced: bool,
}

impl ModelVad {
    fn new(cfg: &VadConfig) -> anyhow::Result<Self> {
        let detector = VoiceActivityDetector::builder()
            .sample_rate(i64::from(SAMPLE_RATE))
            .chunk_size(MODEL_WINDOW_SAMPLES)
            .build()?;
        Ok(Self {
            detector,
            context: Vec::with_capacity(MODEL_WINDOW_SAMPLES),
            th_high: cfg.threshold,
            th_low: cfg.threshold_low,
            voiced: false,
        })
    }

    fn classify(&mut self, samples: &[i16]) -> bool {
        self.context.extend_from_slice(samples);
        let overflow = self.context.len().saturating_sub(MODEL_WINDOW_SAMPLES);
        if overflow > 0 {
            self.context.drain(..overflow);
        }

        let pad = MODEL_WINDOW_SAMPLES - self.context.len();
        let window = std::iter::repeat(0i16)
            .take(pad)
            .chain(self.context.iter().copied());
        let prob = self.detector.predict(window);

        if prob >= self.th_high {
            self.voiced = true;
        } else if prob <= self.th_low {
            self.voiced = false;
        }
        self.voiced
    }

    fn reset(&mut self) {
        self.context.clear();
        self.voiced = false;
    }
}

/// Per-session VAD: framing stash, engine, window vote, counters.
pub struct VadProcessor {
    engine: VadEngine,
    stash: Vec<u8>,
    window: VecDeque<bool>,
    window_frames: usize,
    window_threshold: usize,
    consecutive_silence: u32,
    recent_voice_frames: u32,
}

impl VadProcessor {
    pub fn new(cfg: &VadConfig) -> anyhow::Result<Self> {
        let engine = match cfg.engine {
            VadEngineKind::Energy => VadEngine::Energy(EnergyVad::new(cfg)),
            VadEngineKind::Model => VadEngine::Model(ModelVad::new(cfg)?),
        };
        Ok(Self {
            engine,
            stash: Vec::new(),
            window: VecDeque::with_capacity(cfg.window_frames),
            window_frames: cfg.window_frames,
            window_threshold: cfg.frame_window_threshold,
            consecutive_silence: 0,
            recent_voice_frames: 0,
        })
    }

    /// Classify one packet's PCM. Partial frames stay in the stash until
    /// the next packet completes them.
    pub fn process(&mut self, pcm: &[u8]) -> VadVerdict {
        self.stash.extend_from_slice(pcm);

        let mut frames = Vec::new();
        let mut voiced_pcm = Vec::new();
        let mut speech = false;

        while self.stash.len() >= FRAME_BYTES {
            let frame_bytes: Vec<u8> = self.stash.drain(..FRAME_BYTES).collect();
            let samples = bytes_to_samples(&frame_bytes);
            let voiced = self.engine.classify(&samples);

            if self.window.len() == self.window_frames {
                self.window.pop_front();
            }
            self.window.push_back(voiced);
            let windowed = self.window.iter().filter(|&&v| v).count() >= self.window_threshold;

            if voiced {
                self.consecutive_silence = 0;
                self.recent_voice_frames = (self.recent_voice_frames + 1).min(1000);
                voiced_pcm.extend_from_slice(&frame_bytes);
            } else {
                self.consecutive_silence += 1;
                self.recent_voice_frames = 0;
            }

            speech |= windowed;
            frames.push(FrameClass { voiced, windowed });
        }

        VadVerdict {
            speech,
            frames,
            voiced_pcm,
        }
    }

    pub fn consecutive_silence(&self) -> u32 {
        self.consecutive_silence
    }

    pub fn recent_voice_frames(&self) -> u32 {
        self.recent_voice_frames
    }

    /// Zero the silence counters only. The wake path calls this
    /// mid-stream, so the framing stash, the vote window, and engine
    /// hysteresis are left intact.
    pub fn reset_counters(&mut self) {
        self.consecutive_silence = 0;
        self.recent_voice_frames = 0;
    }

    /// Reset counters, window, stash, and engine hysteresis. Called on
    /// utterance flush and on session close.
    pub fn reset(&mut self) {
        self.stash.clear();
        self.window.clear();
        self.consecutive_silence = 0;
        self.recent_voice_frames = 0;
        self.engine.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples_to_bytes;

    /// Fast-settling energy config so silence registers within a few
    /// frames instead of the production ~1 s integrator tail.
    fn snappy_config() -> VadConfig {
        VadConfig {
            engine: VadEngineKind::Energy,
            gate_on: 200.0,
            gate_off: None,
            tau_ms: 10.0,
            calibration_ms: 0,
            window_frames: 5,
            frame_window_threshold: 2,
            ..VadConfig::default()
        }
    }

    fn voiced_frame() -> Vec<u8> {
        samples_to_bytes(&vec![2000i16; FRAME_SAMPLES])
    }

    fn silent_frame() -> Vec<u8> {
        samples_to_bytes(&vec![0i16; FRAME_SAMPLES])
    }

    #[test]
    fn test_rms_calculation() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&vec![0i16; 320]), 0.0);
        let signal = vec![100i16; 320];
        assert!((rms(&signal) - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_energy_gate_transitions() {
        let mut vad = VadProcessor::new(&snappy_config()).unwrap();

        // loud frames open the gate; window vote needs two of them
        let first = vad.process(&voiced_frame());
        assert!(first.frames[0].voiced);
        assert!(!first.frames[0].windowed);

        let second = vad.process(&voiced_frame());
        assert!(second.frames[0].windowed);
        assert!(second.speech);
        assert_eq!(vad.recent_voice_frames(), 2);
        assert_eq!(vad.consecutive_silence(), 0);

        // silence decays the integrator shut within a few frames
        let mut went_silent = false;
        for _ in 0..6 {
            let verdict = vad.process(&silent_frame());
            if !verdict.frames[0].voiced {
                went_silent = true;
            }
        }
        assert!(went_silent);
        assert!(vad.consecutive_silence() > 0);
        assert_eq!(vad.recent_voice_frames(), 0);
    }

    #[test]
    fn test_voiced_pcm_excludes_silence() {
        let mut vad = VadProcessor::new(&snappy_config()).unwrap();
        let verdict = vad.process(&voiced_frame());
        assert_eq!(verdict.voiced_pcm.len(), FRAME_BYTES);

        for _ in 0..8 {
            vad.process(&silent_frame());
        }
        let silent = vad.process(&silent_frame());
        assert!(silent.voiced_pcm.is_empty());
    }

    #[test]
    fn test_partial_frames_stash() {
        let mut vad = VadProcessor::new(&snappy_config()).unwrap();
        let frame = voiced_frame();

        // half a frame produces no classification
        let half = vad.process(&frame[..FRAME_BYTES / 2]);
        assert!(half.frames.is_empty());

        // the second half completes it
        let rest = vad.process(&frame[FRAME_BYTES / 2..]);
        assert_eq!(rest.frames.len(), 1);
        assert!(rest.frames[0].voiced);
    }

    #[test]
    fn test_reset_clears_counters_and_window() {
        let mut vad = VadProcessor::new(&snappy_config()).unwrap();
        vad.process(&voiced_frame());
        vad.process(&voiced_frame());
        vad.reset();
        assert_eq!(vad.recent_voice_frames(), 0);
        assert_eq!(vad.consecutive_silence(), 0);

        // after reset a single voiced frame is not yet a windowed vote
        let verdict = vad.process(&voiced_frame());
        assert!(!verdict.frames[0].windowed);
    }

    #[test]
    fn test_noise_floor_calibration() {
        let cfg = VadConfig {
            calibration_ms: 100, // 5 frames
            tau_ms: 10.0,
            gate_on: 200.0,
            ..snappy_config()
        };
        let mut vad = VadProcessor::new(&cfg).unwrap();

        // steady background hum during calibration
        let hum = samples_to_bytes(&vec![150i16; FRAME_SAMPLES]);
        for _ in 0..5 {
            vad.process(&hum);
        }

        // after calibration the hum sits at the noise floor: no voice
        let verdict = vad.process(&hum);
        assert!(!verdict.frames[0].voiced);

        // a genuinely loud frame still opens the gate
        let verdict = vad.process(&voiced_frame());
        assert!(verdict.frames[0].voiced);
    }
}
