//! Reply-turn lifecycle: recognize, drive dialog, guarantee cleanup.
//!
//! At most one turn runs per session. Every exit path leaves the speaking
//! flag cleared, so a failed turn can never wedge barge-in handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxbridge_core::config::DialogConfig;
use voxbridge_core::protocol::Outbound;
use voxbridge_core::types::{AudioFormat, Utterance};
use voxbridge_providers::ProviderSet;

use crate::SpeechState;
use crate::dialog::{DialogContext, run_dialog};
use crate::recognize::recognize;

/// Everything a turn needs from its session, owned.
pub struct TurnContext {
    pub providers: Arc<ProviderSet>,
    pub dialog_cfg: DialogConfig,
    pub min_pcm_bytes: usize,
    pub session_id: String,
    pub audio_format: AudioFormat,
    pub out_tx: mpsc::UnboundedSender<Outbound>,
    pub speech: SpeechState,
    pub chars_spoken: Arc<AtomicU64>,
}

pub struct TurnHandle {
    pub utterance_seq: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TurnHandle {
    /// Barge-in, client abort, or session teardown.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Spawn the dialog/synthesis task for one utterance. The turn's
/// cancellation token is a child of the session's, so session teardown
/// propagates. When a previous turn is still winding down it is aborted
/// and joined first, so turn N's pump always completes (or cancels)
/// before turn N+1's pump begins.
pub fn spawn_turn(
    ctx: TurnContext,
    utterance: Utterance,
    session_cancel: &CancellationToken,
    previous: Option<TurnHandle>,
) -> TurnHandle {
    let cancel = session_cancel.child_token();
    let utterance_seq = utterance.utterance_seq;
    let turn_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        if let Some(prev) = previous {
            prev.abort();
            prev.join().await;
        }
        run_turn(ctx, utterance, turn_cancel).await;
    });
    TurnHandle {
        utterance_seq,
        cancel,
        join,
    }
}

async fn run_turn(ctx: TurnContext, utterance: Utterance, cancel: CancellationToken) {
    let session_id = ctx.session_id.clone();
    let utterance_seq = utterance.utterance_seq;

    let transcript = recognize(&ctx.providers, &ctx.dialog_cfg, ctx.min_pcm_bytes, &utterance).await;
    if transcript.is_empty() {
        info!(session_id = %session_id, utterance_seq, "Empty transcript; turn skipped");
        return;
    }
    if cancel.is_cancelled() {
        return;
    }

    // output budget: once exceeded, stop serving this connection
    let budget = ctx.dialog_cfg.max_output_chars;
    if budget > 0 && ctx.chars_spoken.load(Ordering::Relaxed) >= budget {
        warn!(session_id = %session_id, utterance_seq, budget, "Output budget exhausted");
        let _ = ctx.out_tx.send(Outbound::Close);
        return;
    }

    let dialog_ctx = DialogContext {
        providers: ctx.providers.clone(),
        cfg: ctx.dialog_cfg.clone(),
        session_id: session_id.clone(),
        utterance_seq,
        audio_format: ctx.audio_format,
        out_tx: ctx.out_tx.clone(),
        cancel: cancel.clone(),
        speech: ctx.speech.clone(),
        chars_spoken: ctx.chars_spoken.clone(),
    };

    match run_dialog(&dialog_ctx, &transcript).await {
        Ok(outcome) => {
            if outcome.close_after_reply {
                let _ = ctx.out_tx.send(Outbound::Close);
            }
        }
        Err(e) => {
            if cancel.is_cancelled() {
                debug!(session_id = %session_id, utterance_seq, "Turn cancelled");
            } else {
                warn!(session_id = %session_id, utterance_seq, error = %e, "Turn failed");
            }
        }
    }

    // invariant: a finished turn never leaves is_speaking set
    ctx.speech.end();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use voxbridge_core::protocol::{DeviceMessage, TtsState};
    use voxbridge_core::types::StopCause;
    use voxbridge_providers::testing::{BrokenLlm, FakeLlm, FakeTranscriber, fake_providers};

    fn utterance(seq: u64, pcm_bytes: usize) -> Utterance {
        let now = std::time::Instant::now();
        Utterance {
            session_id: "s1".into(),
            utterance_seq: seq,
            pcm: vec![0u8; pcm_bytes],
            started_at: now,
            ended_at: now,
            stop_cause: StopCause::ConsecutiveSilence { frames: 10 },
        }
    }

    fn context(
        providers: ProviderSet,
        out_tx: mpsc::UnboundedSender<Outbound>,
        speech: SpeechState,
    ) -> TurnContext {
        TurnContext {
            providers: Arc::new(providers),
            dialog_cfg: DialogConfig {
                // keep tests fast: no pacing backpressure
                pacing_lead_ms: 60_000,
                ..DialogConfig::default()
            },
            min_pcm_bytes: 12_000,
            session_id: "s1".into(),
            audio_format: AudioFormat::Pcm,
            out_tx,
            speech,
            chars_spoken: Arc::new(AtomicU64::new(0)),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn tts_states(messages: &[Outbound]) -> Vec<TtsState> {
        messages
            .iter()
            .filter_map(|m| match m {
                Outbound::Control(DeviceMessage::Tts { state, .. }) => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_clean_turn_wire_order() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let providers = fake_providers("what time is it", &["It is ", "noon."]);
        let cancel = CancellationToken::new();

        spawn_turn(context(providers, out_tx, speech.clone()), utterance(1, 32_000), &cancel, None)
            .join()
            .await;

        let messages = drain(&mut out_rx);

        // stt first
        assert!(matches!(
            messages.first(),
            Some(Outbound::Control(DeviceMessage::Stt { text, .. })) if text == "what time is it"
        ));

        // then start, sentence_start, stop in order
        let states = tts_states(&messages);
        assert_eq!(
            states,
            vec![TtsState::Start, TtsState::SentenceStart, TtsState::Stop]
        );

        // audio frames between start and stop
        assert!(messages.iter().any(|m| matches!(m, Outbound::Audio(_))));
        assert!(!speech.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcription_timeout_yields_silent_turn() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let mut providers = fake_providers("", &["never spoken"]);
        providers.transcription = Arc::new(FakeTranscriber::stalled(Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        spawn_turn(context(providers, out_tx, speech.clone()), utterance(1, 32_000), &cancel, None)
            .join()
            .await;

        // no stt, no tts traffic; session is ready for the next utterance
        assert!(drain(&mut out_rx).is_empty());
        assert!(!speech.is_speaking());
    }

    #[tokio::test]
    async fn test_llm_stream_failure_clears_speaking() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let mut providers = fake_providers("tell me a story", &[]);
        providers.llm = Arc::new(BrokenLlm);
        let cancel = CancellationToken::new();

        spawn_turn(context(providers, out_tx, speech.clone()), utterance(1, 32_000), &cancel, None)
            .join()
            .await;

        let messages = drain(&mut out_rx);
        // every tts:start is matched by a tts:stop
        let states = tts_states(&messages);
        let starts = states.iter().filter(|s| **s == TtsState::Start).count();
        let stops = states.iter().filter(|s| **s == TtsState::Stop).count();
        assert_eq!(starts, stops);
        assert!(!speech.is_speaking());
    }

    #[tokio::test]
    async fn test_abort_mid_stream_sends_stop() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let mut providers = fake_providers("keep talking", &[]);
        providers.llm = Arc::new(FakeLlm::slowly(
            &["One sentence. ", "Two sentences. ", "Three sentences. "],
            Duration::from_millis(30),
        ));
        let cancel = CancellationToken::new();

        let handle = spawn_turn(
            context(providers, out_tx, speech.clone()),
            utterance(1, 32_000),
            &cancel,
            None,
        );

        // wait for speaking to begin, then barge in
        for _ in 0..200 {
            if speech.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(speech.is_speaking());
        handle.abort();
        handle.join().await;

        let states = tts_states(&drain(&mut out_rx));
        assert_eq!(states.last(), Some(&TtsState::Stop));
        assert!(!speech.is_speaking());
    }

    #[tokio::test]
    async fn test_farewell_intent_closes_session() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let providers = fake_providers("goodbye", &["should not reach the llm"]);
        let cancel = CancellationToken::new();

        spawn_turn(context(providers, out_tx, speech.clone()), utterance(1, 32_000), &cancel, None)
            .join()
            .await;

        let messages = drain(&mut out_rx);
        // the fixed farewell is spoken and the session closes after it
        assert!(messages.iter().any(|m| matches!(m, Outbound::Audio(_))));
        assert!(matches!(messages.last(), Some(Outbound::Close)));
        // no stt display for consumed intents
        assert!(
            !messages
                .iter()
                .any(|m| matches!(m, Outbound::Control(DeviceMessage::Stt { .. })))
        );
    }

    #[tokio::test]
    async fn test_two_utterances_independent_turns() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let speech = SpeechState::new();
        let cancel = CancellationToken::new();

        for seq in 1..=2 {
            let providers = fake_providers("again", &["Sure thing."]);
            spawn_turn(
                context(providers, out_tx.clone(), speech.clone()),
                utterance(seq, 32_000),
                &cancel,
                None,
            )
            .join()
            .await;
        }

        let states = tts_states(&drain(&mut out_rx));
        let starts = states.iter().filter(|s| **s == TtsState::Start).count();
        let stops = states.iter().filter(|s| **s == TtsState::Stop).count();
        assert_eq!(starts, 2);
        assert_eq!(stops, 2);
        assert!(!speech.is_speaking());
    }
}
