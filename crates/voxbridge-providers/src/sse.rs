//! SSE data-line parser for streaming provider responses.
//!
//! Only `data:` payloads matter to the chat-completions stream; event
//! names, ids, and comments are skipped. Partial lines are buffered
//! across network chunks.

use anyhow::anyhow;
use futures::Stream;
use tokio_stream::StreamExt;

struct SseState {
    bytes: std::pin::Pin<
        Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buffer: String,
}

/// Parse a reqwest response body as a stream of SSE `data:` payloads.
pub fn data_lines(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<String>> {
    let state = SseState {
        bytes: Box::pin(response.bytes_stream()),
        buffer: String::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(newline_pos) = state.buffer.find('\n') {
                let line = state.buffer[..newline_pos]
                    .trim_end_matches('\r')
                    .to_string();
                state.buffer.drain(..=newline_pos);

                if let Some(value) = line.strip_prefix("data:") {
                    return Some((Ok(value.trim_start().to_string()), state));
                }
                // blank separators, comments, event/id fields
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => {
                    return Some((Err(anyhow!("SSE stream error: {e}")), state));
                }
                None => return None,
            }
        }
    })
}
