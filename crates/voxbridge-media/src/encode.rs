//! Outbound frame encoding for the synthesis path.
//!
//! Synthesis providers emit raw 16 kHz mono PCM16LE. Devices on an Opus
//! session expect 60 ms Opus packets; PCM sessions get fixed 60 ms PCM
//! slices. A stash carries partial frames between provider chunks.

use voxbridge_core::types::AudioFormat;

use crate::{SAMPLE_RATE, bytes_to_samples};

/// Outbound frame length: 60 ms at 16 kHz.
pub const OUT_FRAME_SAMPLES: usize = (SAMPLE_RATE as usize) * 60 / 1000;
pub const OUT_FRAME_BYTES: usize = OUT_FRAME_SAMPLES * 2;

pub struct FrameEncoder {
    format: AudioFormat,
    opus: Option<opus::Encoder>,
    stash: Vec<u8>,
}

impl FrameEncoder {
    pub fn new(format: AudioFormat) -> anyhow::Result<Self> {
        let opus = match format {
            AudioFormat::Opus => Some(opus::Encoder::new(
                SAMPLE_RATE,
                opus::Channels::Mono,
                opus::Application::Voip,
            )?),
            AudioFormat::Pcm => None,
        };
        Ok(Self {
            format,
            opus,
            stash: Vec::new(),
        })
    }

    /// Feed PCM bytes; returns the complete wire frames now available.
    pub fn push(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
        self.stash.extend_from_slice(pcm);

        let mut frames = Vec::new();
        while self.stash.len() >= OUT_FRAME_BYTES {
            let chunk: Vec<u8> = self.stash.drain(..OUT_FRAME_BYTES).collect();
            frames.push(self.encode_frame(&chunk)?);
        }
        Ok(frames)
    }

    /// Pad the stashed tail with silence to a full frame and encode it.
    /// Returns `None` when nothing is pending.
    pub fn finish(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        if self.stash.is_empty() {
            return Ok(None);
        }
        let mut tail = std::mem::take(&mut self.stash);
        tail.resize(OUT_FRAME_BYTES, 0);
        Ok(Some(self.encode_frame(&tail)?))
    }

    /// Drop any pending audio without encoding it.
    pub fn discard(&mut self) {
        self.stash.clear();
    }

    fn encode_frame(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self.format {
            AudioFormat::Pcm => Ok(pcm.to_vec()),
            AudioFormat::Opus => {
                let samples = bytes_to_samples(pcm);
                let encoder = self.opus.as_mut().expect("opus encoder present");
                Ok(encoder.encode_vec(&samples, 4000)?)
            }
        }
    }
}

/// Total playback duration of a PCM byte count, in milliseconds.
pub fn pcm_duration_ms(bytes: usize) -> u64 {
    (bytes as u64) * 1000 / (u64::from(SAMPLE_RATE) * 2)
}
