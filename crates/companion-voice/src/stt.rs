//! Streaming speech recognizer client.
//!
//! Maintains one persistent duplex WebSocket for the life of the call:
//! binary PCM frames go out in arrival order, JSON control messages come
//! back (`Results`, `UtteranceEnd`, `SpeechStarted`, `Metadata`, `Error`).
//! Events are delivered to the state machine over a channel, in arrival
//! order. A keepalive task prevents server-side idle timeout.
//!
//! On unexpected disconnect the client emits [`SttEvent::Disconnected`] and
//! does not reconnect within the session; the call is fatally degraded.

use crate::config::SttConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// A transcript result from the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    /// The text will not be revised further.
    pub is_final: bool,
    /// The server believes the caller's utterance is complete.
    pub speech_final: bool,
    pub confidence: f32,
    /// Audio duration covered by this result, in milliseconds.
    pub audio_ms: u64,
}

/// Events published to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Server-side VAD detected voiced input; carries no text.
    SpeechStarted,
    Transcript(TranscriptEvent),
    /// The upstream connection dropped; the session is degraded.
    Disconnected,
}

/// Capability interface for the recognizer so tests can substitute a
/// scripted fake. Events always arrive through the channel handed out at
/// connect time, never as return values.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Forward one PCM frame (16-bit LE, 8kHz mono), in arrival order.
    async fn send_audio(&self, pcm: &[u8]) -> VoiceResult<()>;
    /// Signal end of audio and give the server a moment to flush finals.
    async fn finish(&self) -> VoiceResult<()>;
    /// Tear the connection down.
    async fn close(&self);
}

/// Wire messages from the recognizer, discriminated on `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        #[serde(default)]
        duration: f64,
        channel: ResultsChannel,
    },
    UtteranceEnd,
    SpeechStarted,
    Metadata,
    Error,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<ResultsAlternative>,
}

#[derive(Debug, Deserialize)]
struct ResultsAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Streaming recognizer over a persistent WebSocket.
pub struct StreamingRecognizer {
    call_id: String,
    sink: Arc<Mutex<WsSink>>,
    connected: Arc<AtomicBool>,
}

impl StreamingRecognizer {
    /// Connect and push the session configuration as query parameters.
    /// Returns the client and the event channel for the state machine.
    pub async fn connect(
        config: &SttConfig,
        call_id: &str,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<SttEvent>)> {
        if config.api_key.is_empty() {
            return Err(VoiceError::Config("recognizer API key not configured".into()));
        }

        let url = format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate=8000&channels=1\
             &punctuate=true&interim_results=true&endpointing={}&smart_format=true",
            config.endpoint, config.model, config.language, config.endpointing_ms
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Stt(format!("bad recognizer URL: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", config.api_key))
                .map_err(|e| VoiceError::Stt(format!("bad auth header: {e}")))?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Stt(format!("recognizer connect failed: {e}")))?;
        info!(target: "companion::stt", call_id, "recognizer connected");

        let (sink, mut stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Receive loop: parse control messages, publish events in order.
        {
            let connected = Arc::clone(&connected);
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Some(event) = parse_server_message(&call_id, &text) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "companion::stt", call_id = %call_id, error = %e, "recognizer receive error");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let _ = event_tx.send(SttEvent::Disconnected);
                info!(target: "companion::stt", call_id = %call_id, "recognizer receive loop ended");
            });
        }

        // Keepalive: empty control message on an interval.
        {
            let sink = Arc::clone(&sink);
            let connected = Arc::clone(&connected);
            let interval = Duration::from_secs(config.keepalive_secs.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if !connected.load(Ordering::SeqCst) {
                        break;
                    }
                    let msg = Message::Text(r#"{"type":"KeepAlive"}"#.to_string());
                    if sink.lock().await.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok((
            Self {
                call_id: call_id.to_string(),
                sink,
                connected,
            },
            event_rx,
        ))
    }
}

fn parse_server_message(call_id: &str, text: &str) -> Option<SttEvent> {
    let parsed: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(target: "companion::stt", call_id, error = %e, "unparseable recognizer message, dropping");
            return None;
        }
    };

    match parsed {
        ServerMessage::Results {
            is_final,
            speech_final,
            duration,
            channel,
        } => {
            let alt = channel.alternatives.into_iter().next()?;
            let text = alt.transcript.trim().to_string();
            // Empty partials are noise; an empty final that closes the
            // utterance still matters for end-of-turn detection.
            if text.is_empty() && !(is_final && speech_final) {
                return None;
            }
            Some(SttEvent::Transcript(TranscriptEvent {
                text,
                is_final,
                speech_final,
                confidence: alt.confidence,
                audio_ms: (duration * 1000.0).round().max(0.0) as u64,
            }))
        }
        // The server's explicit utterance-end message becomes a synthetic
        // empty final that closes the turn.
        ServerMessage::UtteranceEnd => Some(SttEvent::Transcript(TranscriptEvent {
            text: String::new(),
            is_final: true,
            speech_final: true,
            confidence: 1.0,
            audio_ms: 0,
        })),
        ServerMessage::SpeechStarted => Some(SttEvent::SpeechStarted),
        ServerMessage::Metadata => {
            debug!(target: "companion::stt", call_id, "recognizer metadata");
            None
        }
        ServerMessage::Error => {
            warn!(target: "companion::stt", call_id, message = text, "recognizer error message");
            None
        }
        ServerMessage::Other => None,
    }
}

#[async_trait]
impl SpeechRecognizer for StreamingRecognizer {
    async fn send_audio(&self, pcm: &[u8]) -> VoiceResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(VoiceError::Stt("recognizer disconnected".into()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Binary(pcm.to_vec()))
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                VoiceError::Stt(format!("recognizer send failed: {e}"))
            })
    }

    async fn finish(&self) -> VoiceResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            let msg = Message::Text(r#"{"type":"CloseStream"}"#.to_string());
            let _ = self.sink.lock().await.send(msg).await;
            // Grace period for trailing finals.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.sink.lock().await.close().await;
        info!(target: "companion::stt", call_id = %self.call_id, "recognizer closed");
    }
}
