//! Media pipeline: frame decode/encode, VAD, utterance buffering.

pub mod decode;
pub mod encode;
pub mod resample;
pub mod utterance;
pub mod vad;
pub mod wav;

/// Pipeline sample rate: everything downstream of the decoder is 16 kHz
/// mono PCM16LE.
pub const SAMPLE_RATE: u32 = 16_000;

/// VAD frame length: 20 ms at 16 kHz.
pub const FRAME_SAMPLES: usize = 320;

/// VAD frame length in bytes (16-bit samples).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Convert little-endian PCM bytes to i16 samples. A trailing odd byte is
/// dropped.
pub fn bytes_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Convert i16 samples to little-endian PCM bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
