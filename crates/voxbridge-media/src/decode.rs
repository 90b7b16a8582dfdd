//! Inbound frame decoding: one compressed packet in, 16 kHz mono PCM out.
//!
//! The DTX rule is applied at the packet boundary before any decoding:
//! packets at or below the threshold (default 3 bytes) are silence markers
//! from the device, not audio.

use tracing::warn;

use voxbridge_core::config::AudioConfig;
use voxbridge_core::types::AudioFormat;

use crate::resample::LinearResampler;
use crate::{SAMPLE_RATE, samples_to_bytes};

/// Result of decoding one inbound binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPacket {
    /// Tiny packet: the device is signalling silence.
    Dtx,
    /// 16 kHz mono PCM16LE bytes.
    Pcm(Vec<u8>),
}

/// Per-session frame decoder. Resampler state persists across packets.
pub struct FrameDecoder {
    format: AudioFormat,
    dtx_threshold: usize,
    opus: Option<opus::Decoder>,
    decoder_rate: u32,
    decoder_channels: u16,
    resampler: LinearResampler,
    /// Scratch sized for 60 ms at the decoder rate, stereo.
    scratch: Vec<i16>,
}

impl FrameDecoder {
    pub fn new(format: AudioFormat, cfg: &AudioConfig) -> anyhow::Result<Self> {
        let opus = match format {
            AudioFormat::Opus => {
                let channels = if cfg.decoder_channels >= 2 {
                    opus::Channels::Stereo
                } else {
                    opus::Channels::Mono
                };
                Some(opus::Decoder::new(cfg.decoder_sample_rate, channels)?)
            }
            AudioFormat::Pcm => None,
        };

        let max_frame = (cfg.decoder_sample_rate as usize * 60 / 1000)
            * usize::from(cfg.decoder_channels.max(1));

        Ok(Self {
            format,
            dtx_threshold: cfg.dtx_threshold_bytes,
            opus,
            decoder_rate: cfg.decoder_sample_rate,
            decoder_channels: cfg.decoder_channels.max(1),
            resampler: LinearResampler::new(cfg.decoder_sample_rate, SAMPLE_RATE),
            scratch: vec![0i16; max_frame],
        })
    }

    /// Decode one inbound payload. `None` means the packet was malformed
    /// and has been dropped; the session continues.
    pub fn decode(&mut self, packet: &[u8]) -> Option<DecodedPacket> {
        if packet.len() <= self.dtx_threshold {
            return Some(DecodedPacket::Dtx);
        }

        match self.format {
            AudioFormat::Pcm => Some(DecodedPacket::Pcm(packet.to_vec())),
            AudioFormat::Opus => {
                let decoder = self.opus.as_mut().expect("opus decoder present");
                let samples = match decoder.decode(packet, &mut self.scratch, false) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(packet_bytes = packet.len(), error = %e, "dropping undecodable packet");
                        return None;
                    }
                };

                let channels = usize::from(self.decoder_channels);
                let mut mono: Vec<i16> = if channels == 2 {
                    // equal-gain downmix
                    self.scratch[..samples * 2]
                        .chunks_exact(2)
                        .map(|lr| ((i32::from(lr[0]) + i32::from(lr[1])) / 2) as i16)
                        .collect()
                } else {
                    self.scratch[..samples].to_vec()
                };

                if self.decoder_rate != SAMPLE_RATE {
                    mono = self.resampler.resample(&mono);
                }

                Some(DecodedPacket::Pcm(samples_to_bytes(&mono)))
            }
        }
    }

    /// Reset resampler state (new utterance stream, not per utterance).
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

/// Encode 16 kHz mono PCM samples into one Opus packet; test helper and
/// provisioning-asset tool.
pub fn encode_opus_frame(samples: &[i16]) -> anyhow::Result<Vec<u8>> {
    let mut enc = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
    Ok(enc.encode_vec(samples, 4000)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes_to_samples;
    use voxbridge_core::config::AudioConfig;

    fn decoder(format: AudioFormat) -> FrameDecoder {
        FrameDecoder::new(format, &AudioConfig::default()).unwrap()
    }

    #[test]
    fn test_dtx_boundary_exact() {
        let mut dec = decoder(AudioFormat::Pcm);
        // exactly the threshold is DTX
        assert_eq!(dec.decode(&[0u8; 3]), Some(DecodedPacket::Dtx));
        assert_eq!(dec.decode(&[]), Some(DecodedPacket::Dtx));
        // one byte larger is audio
        match dec.decode(&[0u8; 4]) {
            Some(DecodedPacket::Pcm(pcm)) => assert_eq!(pcm.len(), 4),
            other => panic!("expected pcm, got {other:?}"),
        }
    }

    #[test]
    fn test_pcm_passthrough() {
        let mut dec = decoder(AudioFormat::Pcm);
        let payload = vec![1u8; 640];
        assert_eq!(dec.decode(&payload), Some(DecodedPacket::Pcm(payload.clone())));
    }

    #[test]
    fn test_opus_roundtrip_20ms() {
        let samples: Vec<i16> = (0..320).map(|i| ((i % 64) * 100) as i16).collect();
        let packet = encode_opus_frame(&samples).unwrap();
        assert!(packet.len() > 3, "encoded packet too small: {}", packet.len());

        let mut dec = decoder(AudioFormat::Opus);
        match dec.decode(&packet) {
            Some(DecodedPacket::Pcm(pcm)) => {
                assert_eq!(pcm.len(), 640);
                assert_eq!(bytes_to_samples(&pcm).len(), 320);
            }
            other => panic!("expected pcm, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_opus_dropped() {
        let mut dec = decoder(AudioFormat::Opus);
        // code-3 packet with a zero frame count is invalid by construction
        let garbage = vec![0xFFu8, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(dec.decode(&garbage), None);
        // the session survives: a valid packet still decodes afterwards
        let samples = vec![0i16; 320];
        let packet = encode_opus_frame(&samples).unwrap();
        assert!(matches!(dec.decode(&packet), Some(DecodedPacket::Pcm(_))));
    }
}
