//! Per-connection session: inbound demux, the audio pipeline, and the
//! ordered outbound writer.
//!
//! Three concurrency domains per session, as the pipeline requires:
//! inbound frame handling (serialized in this task), dialog/synthesis
//! (one turn task at a time), and the outbound writer consuming an
//! ordered queue. Socket writes only ever happen in the writer.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxbridge_core::config::Config;
use voxbridge_core::protocol::{
    AudioParams, DeviceMessage, ListenState, Outbound, hello_ack,
};
use voxbridge_core::types::{AudioFormat, ListenMode, StopCause, Utterance};
use voxbridge_media::decode::{DecodedPacket, FrameDecoder};
use voxbridge_media::utterance::UtteranceBuffer;
use voxbridge_media::vad::VadProcessor;
use voxbridge_pipeline::SpeechState;
use voxbridge_pipeline::eos::{EosController, FrameOutcome};
use voxbridge_pipeline::turn::{TurnContext, TurnHandle, spawn_turn};
use voxbridge_providers::ProviderSet;

use crate::auth::Principal;
use crate::state::GatewayState;

/// Internal timer signals delivered to the inbound loop.
enum SessionEvent {
    /// The voice-end guard elapsed with no voice returning.
    VoiceEndElapsed,
}

pub struct SessionContext {
    pub state: Arc<GatewayState>,
    pub config: Arc<Config>,
    pub providers: Arc<ProviderSet>,
    pub principal: Principal,
}

/// Accept one authenticated socket and run it to completion.
pub async fn run_session(ctx: SessionContext, socket: WebSocket) {
    let session_id = Uuid::new_v4().to_string();
    let cancel = ctx.state.shutdown.child_token();

    ctx.state
        .register(&session_id, &ctx.principal.device_id, cancel.clone())
        .await;
    info!(
        session_id = %session_id,
        device_id = %ctx.principal.device_id,
        principal = %ctx.principal.name,
        "Session opened"
    );

    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();

    let ping_interval = Duration::from_secs(ctx.config.server.ping_interval_secs);
    let writer = tokio::spawn(outbound_writer(ws_tx, out_rx, ping_interval));

    match Session::new(&ctx, session_id.clone(), out_tx, cancel.clone()) {
        Ok(mut session) => {
            session.run(ws_rx).await;
            session.shutdown().await;
        }
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Session init failed");
        }
    }

    cancel.cancel();
    let _ = writer.await;
    ctx.state.unregister(&session_id).await;
    info!(session_id = %session_id, "Session closed");
}

/// The per-connection state record. All fields are owned here; the
/// inbound loop is the single writer over the buffer and VAD state.
struct Session {
    session_id: String,
    config: Arc<Config>,
    providers: Arc<ProviderSet>,
    audio_format: AudioFormat,
    listen_mode: ListenMode,
    utterance_seq: u64,

    decoder: FrameDecoder,
    vad: VadProcessor,
    eos: EosController,
    buffer: UtteranceBuffer,
    speech: SpeechState,
    chars_spoken: Arc<AtomicU64>,

    out_tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    active_turn: Option<TurnHandle>,
    voice_end_guard: Option<CancellationToken>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,

    last_voice_activity: Instant,
    utterance_started: Option<Instant>,
}

impl Session {
    fn new(
        ctx: &SessionContext,
        session_id: String,
        out_tx: mpsc::UnboundedSender<Outbound>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let config = ctx.config.clone();
        let audio_format = config.audio.format;
        let decoder = FrameDecoder::new(audio_format, &config.audio)?;
        let vad = VadProcessor::new(&config.vad)?;
        let mut eos = EosController::new(config.eos.clone());
        eos.start_listening();

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            session_id,
            providers: ctx.providers.clone(),
            audio_format,
            listen_mode: config.dialog.listen_mode,
            utterance_seq: 0,
            decoder,
            vad,
            eos,
            buffer: UtteranceBuffer::new(),
            speech: SpeechState::new(),
            chars_spoken: Arc::new(AtomicU64::new(0)),
            out_tx,
            cancel,
            active_turn: None,
            voice_end_guard: None,
            events_tx,
            events_rx,
            last_voice_activity: Instant::now(),
            utterance_started: None,
            config,
        })
    }

    async fn run(&mut self, mut ws_rx: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }

                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if !self.handle_audio(&data) {
                            info!(session_id = %self.session_id, "Idle close: no voice activity");
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => self.handle_control(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        warn!(session_id = %self.session_id, error = %e, "Socket read error");
                        break;
                    }
                }
            }
        }
    }

    /// One inbound binary payload. Returns false when the idle-close
    /// deadline has passed.
    fn handle_audio(&mut self, data: &[u8]) -> bool {
        let now = Instant::now();

        let pcm = match self.decoder.decode(data) {
            None => return !self.idle_expired(now),
            Some(DecodedPacket::Dtx) => {
                // DTX never advances counters, but the timer backstop and
                // idle close still apply
                self.run_watchdog(now);
                return !self.idle_expired(now);
            }
            Some(DecodedPacket::Pcm(pcm)) => pcm,
        };

        // reap a turn that ended on its own
        if self.active_turn.as_ref().is_some_and(TurnHandle::is_finished) {
            self.active_turn = None;
        }

        let verdict = self.vad.process(&pcm);
        if verdict.speech {
            self.last_voice_activity = now;
        }

        if self.listen_mode == ListenMode::Manual {
            // push-to-talk: accumulate everything until `listen stop`
            self.buffer.append(pcm);
            return !self.idle_expired(now);
        }

        self.buffer.append(verdict.voiced_pcm);

        let (speaking, lock_until) = self.speech.snapshot();
        self.eos.set_speech(speaking, lock_until);

        for frame in &verdict.frames {
            let voiced = frame.windowed;

            if voiced && self.speech.is_speaking() {
                if self.speech.in_speak_lock(now) {
                    // barge-in inside the speak-lock window is ignored
                    continue;
                }
                let barge_in =
                    self.config.dialog.barge_in || self.listen_mode == ListenMode::Realtime;
                if !barge_in {
                    continue;
                }
                debug!(session_id = %self.session_id, "Barge-in: aborting active turn");
                if let Some(turn) = &self.active_turn {
                    turn.abort();
                }
                self.speech.end();
                self.eos.set_speech(false, None);
            }

            match self.eos.on_frame(voiced, now, self.buffer.size_bytes()) {
                FrameOutcome::Continue => {}
                FrameOutcome::Wake => {
                    self.vad.reset_counters();
                    self.last_voice_activity = now;
                    self.utterance_started.get_or_insert(now);
                }
                FrameOutcome::TrailingStarted => self.arm_voice_end_guard(),
                FrameOutcome::Resumed => self.disarm_voice_end_guard(),
                FrameOutcome::TooShort => {
                    debug!(
                        session_id = %self.session_id,
                        buffered = self.buffer.size_bytes(),
                        "Stop request dropped: utterance below minimum size"
                    );
                }
                FrameOutcome::Flush(cause) => self.flush_utterance(cause),
            }
        }

        self.run_watchdog(now);
        !self.idle_expired(now)
    }

    fn handle_control(&mut self, text: &str) {
        let msg = match serde_json::from_str::<DeviceMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Unparseable control message");
                return;
            }
        };

        match msg {
            DeviceMessage::Hello { audio_params, .. } => {
                if let Some(params) = &audio_params {
                    if params.format == "pcm" {
                        self.set_audio_format(AudioFormat::Pcm);
                    }
                }
                let ack = hello_ack(
                    &self.session_id,
                    AudioParams {
                        format: match self.audio_format {
                            AudioFormat::Opus => "opus".into(),
                            AudioFormat::Pcm => "pcm".into(),
                        },
                        ..AudioParams::server_default()
                    },
                );
                let _ = self.out_tx.send(Outbound::Control(ack));
                self.eos.start_listening();
            }

            DeviceMessage::Listen { state, mode, text } => match state {
                ListenState::Start => {
                    if let Some(mode) = mode {
                        self.listen_mode = mode;
                    }
                    self.vad.reset();
                    self.buffer.clear();
                    self.utterance_started = None;
                    self.eos.start_listening();
                }
                ListenState::Stop => match self.eos.manual_stop(self.buffer.size_bytes()) {
                    FrameOutcome::Flush(cause) => self.flush_utterance(cause),
                    FrameOutcome::TooShort => {
                        debug!(session_id = %self.session_id, "Manual stop on undersized clip");
                        self.buffer.clear();
                        self.utterance_started = None;
                        self.vad.reset();
                        self.eos.start_listening();
                    }
                    _ => {}
                },
                ListenState::Detect => {
                    // wake word detected on-device: the wake audio itself
                    // is not transcribed
                    debug!(
                        session_id = %self.session_id,
                        wake_word = text.as_deref().unwrap_or(""),
                        "Wake word reported"
                    );
                    self.vad.reset();
                    self.buffer.clear();
                    self.utterance_started = None;
                    self.eos.start_listening();
                }
                ListenState::Abort => self.abort_turn(),
            },

            DeviceMessage::Abort { reason } => {
                debug!(
                    session_id = %self.session_id,
                    reason = reason.as_deref().unwrap_or(""),
                    "Client abort"
                );
                self.abort_turn();
            }

            DeviceMessage::Tts { .. } | DeviceMessage::Stt { .. } => {
                debug!(session_id = %self.session_id, "Ignoring server-directed message from client");
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::VoiceEndElapsed => {
                let now = Instant::now();
                let (speaking, lock_until) = self.speech.snapshot();
                self.eos.set_speech(speaking, lock_until);
                if let FrameOutcome::Flush(cause) =
                    self.eos.post_voice_fire(now, self.buffer.size_bytes())
                {
                    self.flush_utterance(cause);
                }
            }
        }
    }

    fn run_watchdog(&mut self, now: Instant) {
        let (speaking, lock_until) = self.speech.snapshot();
        self.eos.set_speech(speaking, lock_until);
        if let FrameOutcome::Flush(cause) = self.eos.check_watchdog(now, self.buffer.size_bytes()) {
            self.flush_utterance(cause);
        }
    }

    /// Hand the buffered utterance to a new reply turn.
    fn flush_utterance(&mut self, cause: StopCause) {
        self.disarm_voice_end_guard();

        let now = Instant::now();
        let pcm = self.buffer.flush();
        self.utterance_seq += 1;
        let silence_frames = self.vad.consecutive_silence();
        self.vad.reset();
        let started_at = self.utterance_started.take().unwrap_or(now);

        info!(
            session_id = %self.session_id,
            utterance_seq = self.utterance_seq,
            stop_cause = %cause,
            pcm_bytes = pcm.len(),
            silence_frames,
            "Utterance complete"
        );

        let utterance = Utterance {
            session_id: self.session_id.clone(),
            utterance_seq: self.utterance_seq,
            pcm,
            started_at,
            ended_at: now,
            stop_cause: cause,
        };

        let ctx = TurnContext {
            providers: self.providers.clone(),
            dialog_cfg: self.config.dialog.clone(),
            min_pcm_bytes: self.config.eos.min_pcm_bytes,
            session_id: self.session_id.clone(),
            audio_format: self.audio_format,
            out_tx: self.out_tx.clone(),
            speech: self.speech.clone(),
            chars_spoken: self.chars_spoken.clone(),
        };

        let previous = self.active_turn.take();
        self.active_turn = Some(spawn_turn(ctx, utterance, &self.cancel, previous));
    }

    fn abort_turn(&mut self) {
        if let Some(turn) = &self.active_turn {
            turn.abort();
        }
        self.disarm_voice_end_guard();
        self.buffer.clear();
        self.utterance_started = None;
        self.vad.reset();
        self.eos.start_listening();
    }

    fn arm_voice_end_guard(&mut self) {
        self.disarm_voice_end_guard();
        let token = CancellationToken::new();
        let events = self.events_tx.clone();
        let delay = Duration::from_millis(self.config.eos.post_voice_silence_ms);
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(SessionEvent::VoiceEndElapsed);
                }
            }
        });
        self.voice_end_guard = Some(token);
    }

    fn disarm_voice_end_guard(&mut self) {
        if let Some(token) = self.voice_end_guard.take() {
            token.cancel();
        }
    }

    fn set_audio_format(&mut self, format: AudioFormat) {
        if format == self.audio_format {
            return;
        }
        match FrameDecoder::new(format, &self.config.audio) {
            Ok(decoder) => {
                self.decoder = decoder;
                self.audio_format = format;
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Keeping previous audio format");
            }
        }
    }

    fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_voice_activity).as_secs()
            >= self.config.server.close_connection_no_voice_time
    }

    /// Terminate child tasks; called once after the inbound loop exits.
    async fn shutdown(&mut self) {
        self.disarm_voice_end_guard();
        if let Some(turn) = self.active_turn.take() {
            turn.abort();
            turn.join().await;
        }
    }
}

/// Consumes the ordered outbound queue; the only writer to the socket.
async fn outbound_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            msg = out_rx.recv() => match msg {
                None => break,
                Some(Outbound::Control(control)) => {
                    let json = match serde_json::to_string(&control) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "Unserializable control message");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Audio(frame)) => {
                    if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}
