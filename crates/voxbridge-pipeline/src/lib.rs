//! The per-connection real-time pipeline: end-of-speech detection,
//! recognition fan-out, dialog driving, and the synthesis pump.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub mod dialog;
pub mod eos;
pub mod recognize;
pub mod synthesis;
pub mod turn;

/// Speaking state shared between the inbound frame path and the active
/// reply turn. `is_speaking` is true exactly while a TTS start/stop pair
/// is open.
#[derive(Clone, Default)]
pub struct SpeechState {
    inner: Arc<Mutex<SpeechFlags>>,
}

#[derive(Default)]
struct SpeechFlags {
    speaking: bool,
    lock_until: Option<Instant>,
}

impl SpeechState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the session speaking and arm the speak-lock.
    pub fn begin(&self, lock: Duration) {
        let mut flags = self.inner.lock().expect("speech lock");
        flags.speaking = true;
        flags.lock_until = Some(Instant::now() + lock);
    }

    /// Clear speaking and the speak-lock.
    pub fn end(&self) {
        let mut flags = self.inner.lock().expect("speech lock");
        flags.speaking = false;
        flags.lock_until = None;
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().expect("speech lock").speaking
    }

    /// True while speaking and still inside the post-TTS-start window.
    pub fn in_speak_lock(&self, now: Instant) -> bool {
        let flags = self.inner.lock().expect("speech lock");
        flags.speaking && flags.lock_until.is_some_and(|until| now < until)
    }

    /// (speaking, lock deadline) for feeding the EoS controller.
    pub fn snapshot(&self) -> (bool, Option<Instant>) {
        let flags = self.inner.lock().expect("speech lock");
        (flags.speaking, flags.lock_until)
    }
}
