//! Media-stream wire messages.
//!
//! The gateway is the server side of a telephony media-stream WebSocket.
//! Messages are JSON with an `event` discriminator; audio rides in
//! `media.payload` as base64 μ-law. Outbound we produce `media` frames and
//! the `clear` control frame that tells the transport to drop queued audio
//! it has not yet played.

use crate::error::{VoiceError, VoiceResult};
use serde::Deserialize;
use serde_json::json;

/// Inbound message from the transport. Unknown events deserialize to
/// `Other` and are ignored rather than failing the session.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamInbound {
    Connected,
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    Media {
        media: MediaPayload,
    },
    Stop,
    #[serde(other)]
    Other,
}

/// Metadata carried on the `start` event.
#[derive(Debug, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(rename = "mediaFormat", default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(rename = "sampleRate", default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u32,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded μ-law audio.
    pub payload: String,
}

/// Parse one inbound text frame. Malformed JSON is a `MalformedFrame` error
/// the caller logs and drops; it never tears down the session.
pub fn parse_inbound(text: &str) -> VoiceResult<StreamInbound> {
    serde_json::from_str(text)
        .map_err(|e| VoiceError::MalformedFrame(format!("bad stream message: {e}")))
}

/// Outbound `media` frame carrying base64 μ-law audio.
pub fn media_frame(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
    .to_string()
}

/// Outbound `clear` frame: drop all queued, unplayed audio immediately.
pub fn clear_frame(stream_sid: &str) -> String {
    json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event() {
        let text = r#"{
            "event": "start",
            "streamSid": "MZ123",
            "start": {
                "callSid": "CA456",
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        match parse_inbound(text).unwrap() {
            StreamInbound::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA456");
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_event() {
        let text = r#"{"event":"media","media":{"payload":"//8A"}}"#;
        match parse_inbound(text).unwrap() {
            StreamInbound::Media { media } => assert_eq!(media.payload, "//8A"),
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_tolerated() {
        let parsed = parse_inbound(r#"{"event":"mark","name":"x"}"#).unwrap();
        assert!(matches!(parsed, StreamInbound::Other));
    }

    #[test]
    fn malformed_json_is_a_malformed_frame() {
        let err = parse_inbound("{not json").unwrap_err();
        assert!(matches!(err, VoiceError::MalformedFrame(_)));
    }

    #[test]
    fn clear_frame_carries_only_stream_sid() {
        let v: serde_json::Value = serde_json::from_str(&clear_frame("MZ1")).unwrap();
        assert_eq!(v["event"], "clear");
        assert_eq!(v["streamSid"], "MZ1");
        assert!(v.get("media").is_none());
    }
}
