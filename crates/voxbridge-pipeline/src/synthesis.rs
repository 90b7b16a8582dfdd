//! The synthesis pump: reply text in, ordered wire frames out.
//!
//! Sentence boundaries drive the control-message framing: `tts:start`
//! once per turn on first dispatch (arming the speak-lock),
//! `tts:sentence_start` per sentence, `tts:stop` after the last frame or
//! on cancellation. Frames are paced so the device buffer never runs more
//! than a small lead ahead of real-time playback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use voxbridge_core::protocol::{DeviceMessage, Outbound, TtsState};
use voxbridge_core::types::AudioFormat;
use voxbridge_media::encode::FrameEncoder;
use voxbridge_providers::SynthesisProvider;

use crate::SpeechState;

/// Playback duration of one wire frame.
const WIRE_FRAME_MS: u64 = 60;

pub struct PumpArgs {
    pub synthesis: Arc<dyn SynthesisProvider>,
    pub session_id: String,
    pub audio_format: AudioFormat,
    pub tts_start_lock: Duration,
    pub chunk_idle_timeout: Duration,
    pub pacing_lead_ms: u64,
    pub out_tx: mpsc::UnboundedSender<Outbound>,
    pub cancel: CancellationToken,
    pub speech: SpeechState,
}

/// Drive one turn's synthesis. Returns when the text channel closes and
/// all audio is flushed, or on cancellation/provider failure. In every
/// exit path where a `tts:start` was sent, a `tts:stop` follows and the
/// speaking flag is cleared.
pub async fn run_pump(
    args: PumpArgs,
    text_rx: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let mut pump = Pump {
        encoder: FrameEncoder::new(args.audio_format)?,
        pacer: Pacer::new(args.pacing_lead_ms),
        started: false,
        args,
    };

    let result = pump.run(text_rx).await;

    if pump.started {
        let _ = pump.send_control(TtsState::Stop, None);
        pump.args.speech.end();
    }
    result
}

struct Pump {
    args: PumpArgs,
    encoder: FrameEncoder,
    pacer: Pacer,
    started: bool,
}

impl Pump {
    async fn run(&mut self, mut text_rx: mpsc::Receiver<String>) -> anyhow::Result<()> {
        let mut splitter = SentenceSplitter::default();

        loop {
            let chunk = tokio::select! {
                _ = self.args.cancel.cancelled() => {
                    self.encoder.discard();
                    return Err(anyhow!("synthesis cancelled"));
                }
                chunk = text_rx.recv() => chunk,
            };

            match chunk {
                Some(text) => {
                    for sentence in splitter.push(&text) {
                        self.speak_sentence(&sentence).await?;
                    }
                }
                None => break,
            }
        }

        if let Some(tail) = splitter.finish() {
            self.speak_sentence(&tail).await?;
        }

        if self.started {
            if let Some(frame) = self.encoder.finish()? {
                self.send_audio(frame).await?;
            }
        }
        Ok(())
    }

    async fn speak_sentence(&mut self, text: &str) -> anyhow::Result<()> {
        if !self.started {
            self.started = true;
            self.args.speech.begin(self.args.tts_start_lock);
            self.send_control(TtsState::Start, None)?;
        }
        self.send_control(TtsState::SentenceStart, Some(text.to_string()))?;

        let mut stream = self.args.synthesis.stream_speech(text).await?;
        loop {
            let next = tokio::select! {
                _ = self.args.cancel.cancelled() => {
                    self.encoder.discard();
                    return Err(anyhow!("synthesis cancelled"));
                }
                next = timeout(self.args.chunk_idle_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => return Err(anyhow!("synthesis chunk idle timeout")),
                Ok(None) => break,
                Ok(Some(Ok(pcm))) => {
                    for frame in self.encoder.push(&pcm)? {
                        self.send_audio(frame).await?;
                    }
                }
                Ok(Some(Err(e))) => return Err(e),
            }
        }
        Ok(())
    }

    async fn send_audio(&mut self, frame: Vec<u8>) -> anyhow::Result<()> {
        let delay = self.pacer.delay_for(WIRE_FRAME_MS, Instant::now());
        if !delay.is_zero() {
            tokio::select! {
                _ = self.args.cancel.cancelled() => {
                    self.encoder.discard();
                    return Err(anyhow!("synthesis cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.args
            .out_tx
            .send(Outbound::Audio(frame))
            .map_err(|_| anyhow!("outbound queue closed"))
    }

    fn send_control(&self, state: TtsState, text: Option<String>) -> anyhow::Result<()> {
        self.args
            .out_tx
            .send(Outbound::Control(DeviceMessage::Tts {
                state,
                text,
                session_id: Some(self.args.session_id.clone()),
            }))
            .map_err(|_| anyhow!("outbound queue closed"))
    }
}

/// Keeps outbound audio no more than `lead_ms` ahead of real-time
/// playback.
struct Pacer {
    started: Option<Instant>,
    sent_ms: u64,
    lead_ms: u64,
}

impl Pacer {
    fn new(lead_ms: u64) -> Self {
        Self {
            started: None,
            sent_ms: 0,
            lead_ms,
        }
    }

    fn delay_for(&mut self, chunk_ms: u64, now: Instant) -> Duration {
        let start = *self.started.get_or_insert(now);
        self.sent_ms += chunk_ms;
        let elapsed = now.duration_since(start).as_millis() as u64;
        Duration::from_millis(self.sent_ms.saturating_sub(elapsed + self.lead_ms))
    }
}

/// Accumulates streamed text and yields complete sentences.
#[derive(Default)]
pub struct SentenceSplitter {
    buf: String,
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '\n' | '。' | '！' | '？' | '；')
}

impl SentenceSplitter {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.find(is_terminator) {
            // consume the terminator and any run of terminators ("...", "?!")
            let mut end = pos;
            for c in self.buf[pos..].chars() {
                if is_terminator(c) {
                    end += c.len_utf8();
                } else {
                    break;
                }
            }
            let sentence: String = self.buf.drain(..end).collect();
            let trimmed = sentence.trim();
            if trimmed.chars().any(|c| !is_terminator(c)) {
                out.push(trimmed.to_string());
            }
        }
        out
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let trimmed = rest.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_providers::testing::FakeSynthesizer;

    fn pump_args(
        out_tx: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
        speech: SpeechState,
    ) -> PumpArgs {
        PumpArgs {
            synthesis: Arc::new(FakeSynthesizer::default()),
            session_id: "s1".into(),
            audio_format: AudioFormat::Pcm,
            tts_start_lock: Duration::from_millis(1200),
            chunk_idle_timeout: Duration::from_secs(30),
            pacing_lead_ms: 10_000, // effectively unpaced in tests
            out_tx,
            cancel,
            speech,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_sentence_splitter() {
        let mut splitter = SentenceSplitter::default();
        assert!(splitter.push("Hello wor").is_empty());
        assert_eq!(splitter.push("ld. How are"), vec!["Hello world."]);
        assert_eq!(splitter.push(" you?!"), vec!["How are you?!"]);
        assert!(splitter.finish().is_none());

        let mut splitter = SentenceSplitter::default();
        splitter.push("no terminator here");
        assert_eq!(splitter.finish().as_deref(), Some("no terminator here"));

        // bare terminators never become sentences
        let mut splitter = SentenceSplitter::default();
        assert!(splitter.push("...").is_empty());
    }

    #[tokio::test]
    async fn test_wire_order_start_sentences_audio_stop() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::channel(8);
        let speech = SpeechState::new();
        let cancel = CancellationToken::new();

        text_tx.send("First one. Second".to_string()).await.unwrap();
        text_tx.send(" one.".to_string()).await.unwrap();
        drop(text_tx);

        run_pump(pump_args(out_tx, cancel, speech.clone()), text_rx)
            .await
            .unwrap();

        let messages = drain(&mut out_rx);
        let controls: Vec<&DeviceMessage> = messages
            .iter()
            .filter_map(|m| match m {
                Outbound::Control(c) => Some(c),
                _ => None,
            })
            .collect();

        // tts:start, sentence_start x2, tts:stop
        assert!(matches!(
            controls.first(),
            Some(DeviceMessage::Tts { state: TtsState::Start, .. })
        ));
        let sentence_starts: Vec<_> = controls
            .iter()
            .filter_map(|c| match c {
                DeviceMessage::Tts {
                    state: TtsState::SentenceStart,
                    text: Some(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(sentence_starts, vec!["First one.", "Second one."]);
        assert!(matches!(
            controls.last(),
            Some(DeviceMessage::Tts { state: TtsState::Stop, .. })
        ));

        // audio frames exist and all precede the stop
        let audio_count = messages
            .iter()
            .filter(|m| matches!(m, Outbound::Audio(_)))
            .count();
        assert!(audio_count >= 2);
        assert!(matches!(messages.last(), Some(Outbound::Control(_))));

        // is_speaking is true exactly while a start/stop pair is open
        assert!(!speech.is_speaking());
    }

    #[tokio::test]
    async fn test_no_text_no_messages() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::channel::<String>(1);
        drop(text_tx);

        run_pump(
            pump_args(out_tx, CancellationToken::new(), SpeechState::new()),
            text_rx,
        )
        .await
        .unwrap();

        assert!(drain(&mut out_rx).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_sends_stop_and_clears_speaking() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::channel(8);
        let speech = SpeechState::new();
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_pump(
            pump_args(out_tx, cancel.clone(), speech.clone()),
            text_rx,
        ));

        text_tx.send("A sentence. ".to_string()).await.unwrap();
        // wait for the turn to actually begin speaking
        for _ in 0..100 {
            if speech.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(speech.is_speaking());

        cancel.cancel();
        let result = pump.await.unwrap();
        assert!(result.is_err());

        let messages = drain(&mut out_rx);
        assert!(matches!(
            messages.last(),
            Some(Outbound::Control(DeviceMessage::Tts {
                state: TtsState::Stop,
                ..
            }))
        ));
        assert!(!speech.is_speaking());
    }

    #[test]
    fn test_pacer_throttles_past_lead() {
        let mut pacer = Pacer::new(120);
        let t0 = Instant::now();
        // first two frames fit inside the lead window
        assert_eq!(pacer.delay_for(60, t0), Duration::ZERO);
        assert_eq!(pacer.delay_for(60, t0), Duration::ZERO);
        // the third must wait for playback to catch up
        assert_eq!(pacer.delay_for(60, t0), Duration::from_millis(60));
    }
}
