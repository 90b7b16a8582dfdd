//! Recognition dispatch: parallel transcription and speaker
//! identification over the flushed utterance.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use voxbridge_core::config::DialogConfig;
use voxbridge_core::types::{Transcript, Utterance};
use voxbridge_media::wav::pcm_to_wav;
use voxbridge_providers::ProviderSet;

/// Run transcription and (if configured) speaker identification
/// concurrently, each under its own timeout. A transcription failure or
/// timeout is fatal to this utterance and yields an empty transcript;
/// an identification failure only drops the label.
pub async fn recognize(
    providers: &ProviderSet,
    cfg: &DialogConfig,
    min_pcm_bytes: usize,
    utterance: &Utterance,
) -> Transcript {
    if utterance.pcm.len() < min_pcm_bytes {
        info!(
            session_id = %utterance.session_id,
            utterance_seq = utterance.utterance_seq,
            pcm_bytes = utterance.pcm.len(),
            "Skipping recognition: audio below minimum"
        );
        return Transcript::empty();
    }

    let wav = pcm_to_wav(&utterance.pcm, 16_000, 1, 16);
    let limit = Duration::from_secs(cfg.recognition_timeout_secs);

    let transcription = timeout(
        limit,
        providers
            .transcription
            .transcribe(wav.clone(), &utterance.session_id),
    );

    let (text, speaker) = match &providers.speaker_id {
        Some(speaker_id) => {
            let identification = timeout(limit, speaker_id.identify(wav, &utterance.session_id));
            let (text_result, speaker_result) = tokio::join!(transcription, identification);
            (
                unwrap_transcription(text_result, utterance),
                unwrap_identification(speaker_result, utterance),
            )
        }
        None => (unwrap_transcription(transcription.await, utterance), None),
    };

    if !text.is_empty() {
        info!(
            session_id = %utterance.session_id,
            utterance_seq = utterance.utterance_seq,
            stop_cause = %utterance.stop_cause,
            speaker = speaker.as_deref().unwrap_or(""),
            "Recognized utterance"
        );
    }

    Transcript { text, speaker }
}

fn unwrap_transcription(
    result: Result<anyhow::Result<String>, tokio::time::error::Elapsed>,
    utterance: &Utterance,
) -> String {
    match result {
        Ok(Ok(text)) => text.trim().to_string(),
        Ok(Err(e)) => {
            warn!(
                session_id = %utterance.session_id,
                utterance_seq = utterance.utterance_seq,
                error = %e,
                "Transcription failed"
            );
            String::new()
        }
        Err(_) => {
            warn!(
                session_id = %utterance.session_id,
                utterance_seq = utterance.utterance_seq,
                "Transcription timed out"
            );
            String::new()
        }
    }
}

fn unwrap_identification(
    result: Result<anyhow::Result<Option<String>>, tokio::time::error::Elapsed>,
    utterance: &Utterance,
) -> Option<String> {
    match result {
        Ok(Ok(label)) => label,
        Ok(Err(e)) => {
            warn!(
                session_id = %utterance.session_id,
                utterance_seq = utterance.utterance_seq,
                error = %e,
                "Speaker identification failed"
            );
            None
        }
        Err(_) => {
            warn!(
                session_id = %utterance.session_id,
                utterance_seq = utterance.utterance_seq,
                "Speaker identification timed out"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use voxbridge_core::types::StopCause;
    use voxbridge_providers::testing::{FakeSpeakerId, FakeTranscriber, fake_providers};

    fn utterance(pcm_bytes: usize) -> Utterance {
        let now = std::time::Instant::now();
        Utterance {
            session_id: "s1".into(),
            utterance_seq: 1,
            pcm: vec![0u8; pcm_bytes],
            started_at: now,
            ended_at: now,
            stop_cause: StopCause::SilenceDuration { ms: 700 },
        }
    }

    #[tokio::test]
    async fn test_transcript_and_speaker() {
        let mut providers = fake_providers("turn on the lights", &[]);
        providers.speaker_id = Some(Arc::new(FakeSpeakerId {
            label: Some("alice".into()),
            delay: None,
        }));

        let result = recognize(&providers, &DialogConfig::default(), 12_000, &utterance(32_000)).await;
        assert_eq!(result.text, "turn on the lights");
        assert_eq!(result.speaker.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_min_audio_guard_skips_providers() {
        let providers = fake_providers("should never run", &[]);
        let result = recognize(&providers, &DialogConfig::default(), 12_000, &utterance(6_000)).await;
        assert!(result.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcription_timeout_is_fatal() {
        let mut providers = fake_providers("", &[]);
        providers.transcription = Arc::new(FakeTranscriber::stalled(Duration::from_secs(60)));

        let result = recognize(&providers, &DialogConfig::default(), 12_000, &utterance(32_000)).await;
        assert!(result.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identification_timeout_is_not_fatal() {
        let mut providers = fake_providers("hello there", &[]);
        providers.speaker_id = Some(Arc::new(FakeSpeakerId {
            label: Some("late-label".into()),
            delay: Some(Duration::from_secs(60)),
        }));

        let result = recognize(&providers, &DialogConfig::default(), 12_000, &utterance(32_000)).await;
        assert_eq!(result.text, "hello there");
        assert!(result.speaker.is_none());
    }
}
