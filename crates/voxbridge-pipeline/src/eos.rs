//! End-of-speech detection.
//!
//! A pure state machine over per-frame VAD classifications: the session
//! feeds it frames (and timer ticks) with an explicit `now`, and it
//! answers with the transitions the session must act on. Keeping it free
//! of I/O makes the counter/timer race and the suppression windows
//! directly testable.

use std::time::{Duration, Instant};

use voxbridge_core::config::EosConfig;
use voxbridge_core::types::StopCause;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosState {
    Idle,
    Listening,
    Voiced,
    TrailingSilence,
}

/// What the session must do after one frame or timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// First voiced frame: reset VAD counters, stamp activity.
    Wake,
    /// Voiced run ended: schedule the voice-end guard.
    TrailingStarted,
    /// Voice returned during trailing silence: cancel the guard.
    Resumed,
    /// Flush the utterance buffer and dispatch recognition.
    Flush(StopCause),
    /// A stop condition fired but the buffer is below the minimum; the
    /// stop request is dropped and capture continues.
    TooShort,
}

pub struct EosController {
    cfg: EosConfig,
    state: EosState,
    wake_until: Option<Instant>,
    speaking: bool,
    speak_lock_until: Option<Instant>,
    last_voice: Option<Instant>,
    trailing_frames: u32,
}

impl EosController {
    pub fn new(cfg: EosConfig) -> Self {
        Self {
            cfg,
            state: EosState::Idle,
            wake_until: None,
            speaking: false,
            speak_lock_until: None,
            last_voice: None,
            trailing_frames: 0,
        }
    }

    pub fn state(&self) -> EosState {
        self.state
    }

    /// Session ready (or re-armed after a flush).
    pub fn start_listening(&mut self) {
        self.state = EosState::Listening;
        self.wake_until = None;
        self.last_voice = None;
        self.trailing_frames = 0;
    }

    /// Mirror the session's speaking flag and speak-lock deadline.
    pub fn set_speech(&mut self, speaking: bool, lock_until: Option<Instant>) {
        self.speaking = speaking;
        self.speak_lock_until = lock_until;
    }

    /// Flushing is suppressed inside the wake-guard, and inside the
    /// speak-lock while the session is speaking. Counters keep running.
    fn suppressed(&self, now: Instant) -> bool {
        if self.wake_until.is_some_and(|until| now < until) {
            return true;
        }
        self.speaking && self.speak_lock_until.is_some_and(|until| now < until)
    }

    /// Refresh the last-voice timestamp, debounced so a single spike
    /// cannot keep resetting the silence timer.
    fn refresh_last_voice(&mut self, now: Instant) {
        let debounce = Duration::from_millis(self.cfg.voice_debounce_ms);
        match self.last_voice {
            Some(prev) if now.duration_since(prev) < debounce => {}
            _ => self.last_voice = Some(now),
        }
    }

    /// Feed one frame classification.
    pub fn on_frame(&mut self, voiced: bool, now: Instant, buffered_bytes: usize) -> FrameOutcome {
        match (self.state, voiced) {
            (EosState::Idle, _) => FrameOutcome::Continue,

            (EosState::Listening, true) => {
                self.state = EosState::Voiced;
                self.wake_until = Some(now + Duration::from_millis(self.cfg.wake_guard_ms));
                self.last_voice = Some(now);
                FrameOutcome::Wake
            }
            (EosState::Listening, false) => FrameOutcome::Continue,

            (EosState::Voiced, true) => {
                self.refresh_last_voice(now);
                FrameOutcome::Continue
            }
            (EosState::Voiced, false) => {
                self.state = EosState::TrailingSilence;
                self.trailing_frames = 1;
                FrameOutcome::TrailingStarted
            }

            (EosState::TrailingSilence, true) => {
                self.state = EosState::Voiced;
                self.trailing_frames = 0;
                self.refresh_last_voice(now);
                FrameOutcome::Resumed
            }
            (EosState::TrailingSilence, false) => {
                self.trailing_frames += 1;
                if self.suppressed(now) {
                    return FrameOutcome::Continue;
                }

                // counter and timer race: whichever fires first wins
                let cause = if self.trailing_frames >= self.cfg.silence_false_frames {
                    Some(StopCause::ConsecutiveSilence {
                        frames: self.trailing_frames,
                    })
                } else {
                    self.last_voice.and_then(|lv| {
                        let elapsed = now.duration_since(lv).as_millis() as u64;
                        (elapsed >= self.cfg.min_silence_duration_ms)
                            .then_some(StopCause::SilenceDuration { ms: elapsed })
                    })
                };

                match cause {
                    Some(cause) => self.try_flush(cause, buffered_bytes),
                    None => FrameOutcome::Continue,
                }
            }
        }
    }

    /// Independent backstop: force EoS once silence since the last voiced
    /// frame reaches `watchdog_silence_ms`, regardless of counter state.
    /// This guards against DTX sequences that starve the counter path.
    pub fn check_watchdog(&mut self, now: Instant, buffered_bytes: usize) -> FrameOutcome {
        if !matches!(self.state, EosState::Voiced | EosState::TrailingSilence) {
            return FrameOutcome::Continue;
        }
        if self.suppressed(now) {
            return FrameOutcome::Continue;
        }
        let Some(last_voice) = self.last_voice else {
            return FrameOutcome::Continue;
        };
        let elapsed = now.duration_since(last_voice).as_millis() as u64;
        if elapsed >= self.cfg.watchdog_silence_ms {
            self.try_flush(StopCause::WatchdogSilence, buffered_bytes)
        } else {
            FrameOutcome::Continue
        }
    }

    /// The voice-end guard scheduled on VOICED -> TRAILING_SILENCE.
    pub fn post_voice_fire(&mut self, now: Instant, buffered_bytes: usize) -> FrameOutcome {
        if self.state != EosState::TrailingSilence {
            return FrameOutcome::Continue;
        }
        if self.suppressed(now) {
            return FrameOutcome::Continue;
        }
        self.try_flush(StopCause::PostVoiceSilence, buffered_bytes)
    }

    /// Explicit `listen stop` from the device (manual mode).
    pub fn manual_stop(&mut self, buffered_bytes: usize) -> FrameOutcome {
        if self.state == EosState::Idle {
            return FrameOutcome::Continue;
        }
        self.try_flush(StopCause::ListenStop, buffered_bytes)
    }

    fn try_flush(&mut self, cause: StopCause, buffered_bytes: usize) -> FrameOutcome {
        if buffered_bytes < self.cfg.min_pcm_bytes {
            // obviously-truncated clip: drop the stop request, keep capturing
            self.state = EosState::Voiced;
            self.trailing_frames = 0;
            return FrameOutcome::TooShort;
        }

        self.state = EosState::Listening;
        self.wake_until = None;
        self.last_voice = None;
        self.trailing_frames = 0;
        FrameOutcome::Flush(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(20);
    const BIG: usize = 100_000;

    fn cfg() -> EosConfig {
        EosConfig::default()
    }

    fn controller(cfg: EosConfig) -> EosController {
        let mut eos = EosController::new(cfg);
        eos.start_listening();
        eos
    }

    #[test]
    fn test_wake_on_first_voiced_frame() {
        let mut eos = controller(cfg());
        let t0 = Instant::now();
        assert_eq!(eos.on_frame(false, t0, 0), FrameOutcome::Continue);
        assert_eq!(eos.on_frame(true, t0, 0), FrameOutcome::Wake);
        assert_eq!(eos.state(), EosState::Voiced);
    }

    #[test]
    fn test_counter_fires_on_exactly_nth_frame() {
        // isolate the counter path
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            min_silence_duration_ms: 60_000,
            watchdog_silence_ms: 60_000,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);

        let mut t = t0;
        // 1st unvoiced frame starts trailing silence
        t += FRAME;
        assert_eq!(eos.on_frame(false, t, BIG), FrameOutcome::TrailingStarted);

        // frames 2..=9: still counting
        for _ in 2..10 {
            t += FRAME;
            assert_eq!(eos.on_frame(false, t, BIG), FrameOutcome::Continue);
        }

        // the 10th fires, not the 9th, not the 11th
        t += FRAME;
        assert_eq!(
            eos.on_frame(false, t, BIG),
            FrameOutcome::Flush(StopCause::ConsecutiveSilence { frames: 10 })
        );
        assert_eq!(eos.state(), EosState::Listening);
    }

    #[test]
    fn test_timer_fires_before_counter_when_earlier() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            min_silence_duration_ms: 100,
            silence_false_frames: 100,
            watchdog_silence_ms: 60_000,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        assert_eq!(eos.on_frame(false, t0 + FRAME, BIG), FrameOutcome::TrailingStarted);

        // 120 ms after the last voiced frame the timer path wins
        match eos.on_frame(false, t0 + Duration::from_millis(120), BIG) {
            FrameOutcome::Flush(StopCause::SilenceDuration { ms }) => assert!(ms >= 100),
            other => panic!("expected silence-duration flush, got {other:?}"),
        }
    }

    #[test]
    fn test_voice_resumes_during_trailing_silence() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        assert_eq!(eos.on_frame(false, t0 + FRAME, BIG), FrameOutcome::TrailingStarted);
        assert_eq!(
            eos.on_frame(true, t0 + FRAME * 2, BIG),
            FrameOutcome::Resumed
        );
        assert_eq!(eos.state(), EosState::Voiced);
    }

    #[test]
    fn test_wake_guard_suppresses_flushing() {
        let mut eos = controller(EosConfig {
            min_silence_duration_ms: 100,
            silence_false_frames: 5,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);

        // a 12-frame silent burst entirely within the 300 ms wake guard
        let mut t = t0;
        t += FRAME;
        assert_eq!(eos.on_frame(false, t, BIG), FrameOutcome::TrailingStarted);
        for _ in 0..11 {
            t += FRAME;
            assert_eq!(eos.on_frame(false, t, BIG), FrameOutcome::Continue);
        }

        // once the guard lapses, the next silent frame flushes
        let after_guard = t0 + Duration::from_millis(320);
        assert!(matches!(
            eos.on_frame(false, after_guard, BIG),
            FrameOutcome::Flush(_)
        ));
    }

    #[test]
    fn test_speak_lock_suppresses_flushing() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            min_silence_duration_ms: 100,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        eos.on_frame(false, t0 + FRAME, BIG);

        eos.set_speech(true, Some(t0 + Duration::from_millis(1200)));
        assert_eq!(
            eos.on_frame(false, t0 + Duration::from_millis(500), BIG),
            FrameOutcome::Continue
        );

        // after the lock window the same condition fires
        assert!(matches!(
            eos.on_frame(false, t0 + Duration::from_millis(1300), BIG),
            FrameOutcome::Flush(_)
        ));
    }

    #[test]
    fn test_too_short_clip_drops_stop_request() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            min_silence_duration_ms: 100,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, 6_400);
        eos.on_frame(false, t0 + FRAME, 6_400);

        // 200 ms of audio is below min_pcm_bytes: no flush
        assert_eq!(
            eos.on_frame(false, t0 + Duration::from_millis(200), 6_400),
            FrameOutcome::TooShort
        );
        // capture continues; a later, large-enough utterance flushes
        assert_eq!(eos.state(), EosState::Voiced);
    }

    #[test]
    fn test_watchdog_backstop() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);

        // counter path starved (e.g. DTX): the watchdog still fires at 1 s
        assert_eq!(
            eos.check_watchdog(t0 + Duration::from_millis(900), BIG),
            FrameOutcome::Continue
        );
        assert_eq!(
            eos.check_watchdog(t0 + Duration::from_millis(1000), BIG),
            FrameOutcome::Flush(StopCause::WatchdogSilence)
        );
    }

    #[test]
    fn test_post_voice_guard_only_in_trailing_silence() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        // still voiced: the guard does nothing
        assert_eq!(
            eos.post_voice_fire(t0 + Duration::from_secs(1), BIG),
            FrameOutcome::Continue
        );

        eos.on_frame(false, t0 + FRAME, BIG);
        assert_eq!(
            eos.post_voice_fire(t0 + Duration::from_millis(1020), BIG),
            FrameOutcome::Flush(StopCause::PostVoiceSilence)
        );
    }

    #[test]
    fn test_manual_stop() {
        let mut eos = controller(cfg());
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        assert_eq!(
            eos.manual_stop(BIG),
            FrameOutcome::Flush(StopCause::ListenStop)
        );

        // size guard applies to manual stops too
        let mut eos = controller(cfg());
        eos.on_frame(true, t0, 100);
        assert_eq!(eos.manual_stop(100), FrameOutcome::TooShort);
    }

    #[test]
    fn test_debounce_limits_last_voice_refresh() {
        let mut eos = controller(EosConfig {
            wake_guard_ms: 0,
            min_silence_duration_ms: 300,
            silence_false_frames: 1000,
            watchdog_silence_ms: 60_000,
            ..cfg()
        });
        let t0 = Instant::now();
        eos.on_frame(true, t0, BIG);
        // a voice spike 50 ms later is inside the 100 ms debounce window,
        // so the silence timer still counts from t0
        eos.on_frame(true, t0 + Duration::from_millis(50), BIG);
        eos.on_frame(false, t0 + Duration::from_millis(70), BIG);
        assert!(matches!(
            eos.on_frame(false, t0 + Duration::from_millis(310), BIG),
            FrameOutcome::Flush(StopCause::SilenceDuration { .. })
        ));
    }
}
