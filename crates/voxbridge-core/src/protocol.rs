//! Device wire protocol v1.
//!
//! Devices speak JSON-over-WebSocket text frames with a `type` tag; binary
//! frames carry audio. The server advertises subprotocols `v1` and the
//! legacy `xiaozhi-v1` alias.

use serde::{Deserialize, Serialize};

use crate::types::ListenMode;

/// Protocol version implemented by this server.
pub const PROTOCOL_VERSION: u32 = 1;

/// WebSocket subprotocols accepted from devices.
pub const SUBPROTOCOLS: [&str; 2] = ["v1", "xiaozhi-v1"];

/// A device wire message; both directions share the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceMessage {
    /// Client capability handshake; the server acknowledges with its own
    /// `hello` carrying the session id and effective audio parameters.
    Hello {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_params: Option<AudioParams>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Client -> server listening control.
    Listen {
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListenMode>,
        /// Wake-word text for `detect`.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Client -> server: cancel the current reply turn.
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Server -> client synthesis state.
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Server -> client recognized-transcript display.
    Stt { text: String, session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

/// Audio parameters negotiated in the hello exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl AudioParams {
    /// The server-side defaults: Opus, 16 kHz mono, 60 ms frames.
    pub fn server_default() -> Self {
        Self {
            format: "opus".into(),
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

/// Build the server's hello acknowledgement for a session.
pub fn hello_ack(session_id: &str, audio_params: AudioParams) -> DeviceMessage {
    DeviceMessage::Hello {
        version: Some(PROTOCOL_VERSION),
        transport: Some("websocket".into()),
        audio_params: Some(audio_params),
        session_id: Some(session_id.to_string()),
    }
}

/// A message queued for the outbound writer. Ordering on this queue is the
/// wire ordering guarantee for a session.
#[derive(Debug)]
pub enum Outbound {
    Control(DeviceMessage),
    Audio(Vec<u8>),
    /// Flush the queue and close the socket.
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_roundtrip() {
        let raw = r#"{"type":"listen","state":"start","mode":"manual"}"#;
        let msg: DeviceMessage = serde_json::from_str(raw).unwrap();
        match msg {
            DeviceMessage::Listen { state, mode, text } => {
                assert_eq!(state, ListenState::Start);
                assert_eq!(mode, Some(ListenMode::Manual));
                assert!(text.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_tts_sentence_start_tag() {
        let msg = DeviceMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some("hello".into()),
            session_id: Some("s1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"tts""#));
        assert!(json.contains(r#""state":"sentence_start""#));
    }

    #[test]
    fn test_hello_ack_shape() {
        let ack = hello_ack("abc", AudioParams::server_default());
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["transport"], "websocket");
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["audio_params"]["sample_rate"], 16_000);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"mystery"}"#;
        assert!(serde_json::from_str::<DeviceMessage>(raw).is_err());
    }
}
