//! The dialog driver: transcript in, paced reply audio out.
//!
//! Intent matching runs first and may consume the turn. Otherwise the
//! display transcript is sent, the language model is streamed against the
//! session's history, and tokens are forwarded chunk-by-chunk to the
//! synthesis pump. Cancellation is observed between chunks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use voxbridge_core::config::DialogConfig;
use voxbridge_core::protocol::{DeviceMessage, Outbound};
use voxbridge_core::types::{AudioFormat, Transcript};
use voxbridge_providers::{IntentOutcome, ProviderSet, Role};

use crate::SpeechState;
use crate::synthesis::{PumpArgs, run_pump};

pub struct DialogContext {
    pub providers: Arc<ProviderSet>,
    pub cfg: DialogConfig,
    pub session_id: String,
    pub utterance_seq: u64,
    pub audio_format: AudioFormat,
    pub out_tx: mpsc::UnboundedSender<Outbound>,
    pub cancel: CancellationToken,
    pub speech: SpeechState,
    pub chars_spoken: Arc<AtomicU64>,
}

pub struct DialogOutcome {
    pub close_after_reply: bool,
}

pub async fn run_dialog(
    ctx: &DialogContext,
    transcript: &Transcript,
) -> anyhow::Result<DialogOutcome> {
    match ctx.providers.intent.evaluate(&transcript.text).await {
        Ok(IntentOutcome::Consumed {
            reply,
            close_after_reply,
        }) => {
            debug!(
                session_id = %ctx.session_id,
                utterance_seq = ctx.utterance_seq,
                "Intent consumed the turn"
            );
            if let Some(reply) = reply {
                speak_fixed(ctx, &reply).await?;
            }
            return Ok(DialogOutcome { close_after_reply });
        }
        Ok(IntentOutcome::Pass) => {}
        Err(e) => {
            warn!(
                session_id = %ctx.session_id,
                utterance_seq = ctx.utterance_seq,
                error = %e,
                "Intent matching failed; continuing to LLM"
            );
        }
    }

    let display = sanitize_display_text(&transcript.text);
    if !display.is_empty() {
        ctx.out_tx
            .send(Outbound::Control(DeviceMessage::Stt {
                text: display,
                session_id: ctx.session_id.clone(),
            }))
            .map_err(|_| anyhow!("outbound queue closed"))?;
    }

    // the speaker label wraps the content for the model only
    let user_content = match &transcript.speaker {
        Some(speaker) => format!("{speaker}: {}", transcript.text),
        None => transcript.text.clone(),
    };
    ctx.providers
        .memory
        .append(&ctx.session_id, Role::User, &user_content);
    let history = ctx.providers.memory.history(&ctx.session_id);

    let mut stream = ctx.providers.llm.stream_chat(&history).await?;

    let (text_tx, text_rx) = mpsc::channel::<String>(16);
    let pump = tokio::spawn(run_pump(pump_args(ctx), text_rx));

    let idle = Duration::from_secs(ctx.cfg.chunk_idle_timeout_secs);
    let mut assistant_text = String::new();
    let mut stream_error: Option<anyhow::Error> = None;

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = tokio::time::timeout(idle, stream.next()) => next,
        };

        match next {
            Err(_) => {
                stream_error = Some(anyhow!("LLM chunk idle timeout"));
                ctx.cancel.cancel();
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(chunk))) => {
                assistant_text.push_str(&chunk);
                if text_tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                stream_error = Some(e);
                ctx.cancel.cancel();
                break;
            }
        }
    }

    // closing the channel lets the pump finish its tail
    drop(text_tx);
    drop(stream);

    let pump_result = pump.await;

    if !assistant_text.is_empty() {
        ctx.providers
            .memory
            .append(&ctx.session_id, Role::Assistant, &assistant_text);
        ctx.chars_spoken
            .fetch_add(assistant_text.chars().count() as u64, Ordering::Relaxed);
    }

    if let Some(e) = stream_error {
        return Err(e);
    }
    match pump_result {
        Ok(inner) => inner?,
        Err(join_err) => return Err(anyhow!("synthesis task failed: {join_err}")),
    }

    Ok(DialogOutcome {
        close_after_reply: false,
    })
}

/// Synthesize a fixed reply (intent responses) through the normal pump.
async fn speak_fixed(ctx: &DialogContext, text: &str) -> anyhow::Result<()> {
    let (text_tx, text_rx) = mpsc::channel(1);
    let _ = text_tx.send(text.to_string()).await;
    drop(text_tx);
    run_pump(pump_args(ctx), text_rx).await
}

fn pump_args(ctx: &DialogContext) -> PumpArgs {
    PumpArgs {
        synthesis: ctx.providers.synthesis.clone(),
        session_id: ctx.session_id.clone(),
        audio_format: ctx.audio_format,
        tts_start_lock: Duration::from_millis(ctx.cfg.tts_start_lock_ms),
        chunk_idle_timeout: Duration::from_secs(ctx.cfg.chunk_idle_timeout_secs),
        pacing_lead_ms: ctx.cfg.pacing_lead_ms,
        out_tx: ctx.out_tx.clone(),
        cancel: ctx.cancel.clone(),
        speech: ctx.speech.clone(),
    }
}

/// Strip control characters and pictographs from the transcript shown on
/// the device display.
pub fn sanitize_display_text(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_control() && !is_pictograph(c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_pictograph(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0xFE00..=0xFE0F | 0x200D
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_display_text() {
        assert_eq!(sanitize_display_text("  hello\tworld\n"), "helloworld");
        assert_eq!(sanitize_display_text("nice day \u{1F600}"), "nice day");
        assert_eq!(sanitize_display_text("fine"), "fine");
        assert_eq!(sanitize_display_text("\u{2764}\u{FE0F}"), "");
    }
}
