//! Per-call WebSocket session: upgrade, provider wiring, ingest and egress.
//!
//! The session waits for the `start` event to learn its stream and call
//! identifiers, connects the recognizer, builds the generator with the
//! caller's context dossier, then runs two loops: ingest (caller frames →
//! gateway) and egress (gateway commands → wire JSON). The greeting runs as
//! its own task so the caller can barge in on it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use companion_voice::telephony::{self, StreamInbound};
use companion_voice::{
    GatewayConfig, LlmConfig, MemoryState, NewsTool, PersonProfile, RealtimeGateway,
    StreamingGenerator, StreamingRecognizer, StreamingSynthesizer, SttConfig, ToolBroker,
    TransportCommand, TtsConfig,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    gateway: GatewayConfig,
    stt: SttConfig,
    llm: LlmConfig,
    tts: TtsConfig,
}

impl AppState {
    pub fn from_env() -> anyhow::Result<Self> {
        let gateway = GatewayConfig::from_env();
        let stt = SttConfig::from_env(gateway.end_of_turn_silence_ms)?;
        let llm = LlmConfig::from_env()?;
        let tts = TtsConfig::from_env()?;
        Ok(Self {
            gateway,
            stt,
            llm,
            tts,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Call identifier passed by the webhook that issued the stream URL.
    #[serde(default)]
    call_sid: Option<String>,
}

/// `GET /stream` - WebSocket upgrade for one call's media stream.
pub async fn media_stream(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let hint = params.call_sid.unwrap_or_default();
        if let Err(e) = handle_session(socket, state, hint).await {
            warn!(target: "companion::server", error = %e, "media-stream session failed");
        }
    })
}

/// Caller profile and long-term memory come from the call-management
/// collaborator. This deployment reads them from the environment; an empty
/// profile means an unknown caller.
fn load_caller_context() -> (PersonProfile, MemoryState) {
    let profile = std::env::var("CALLER_PROFILE_JSON")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let memory = std::env::var("CALLER_MEMORY_JSON")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    (profile, memory)
}

async fn handle_session(
    socket: WebSocket,
    state: AppState,
    call_sid_hint: String,
) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Nothing useful can happen before the start event names the stream.
    let (stream_sid, call_sid) = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match telephony::parse_inbound(&text) {
                Ok(StreamInbound::Start { stream_sid, start }) => {
                    let call_sid = if start.call_sid.is_empty() {
                        call_sid_hint.clone()
                    } else {
                        start.call_sid
                    };
                    break (stream_sid, call_sid);
                }
                Ok(StreamInbound::Stop) => return Ok(()),
                Ok(_) => continue,
                Err(e) => {
                    debug!(target: "companion::server", error = %e, "malformed frame before start, dropping");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };
    info!(target: "companion::server", call_id = %call_sid, stream_sid = %stream_sid, "media stream started");

    let (profile, memory) = load_caller_context();

    let (recognizer, stt_events) = StreamingRecognizer::connect(&state.stt, &call_sid).await?;
    let broker = Arc::new(
        ToolBroker::new(state.gateway.tool_timeout_ms, &call_sid)
            .with_tool(Box::new(NewsTool::new())),
    );
    let generator = Arc::new(
        StreamingGenerator::new(state.llm.clone(), &call_sid)
            .with_context(&profile, &memory)
            .with_tools(broker.definitions()),
    );
    let synthesizer = Arc::new(StreamingSynthesizer::new(state.tts.clone(), &call_sid));

    let (out_tx, mut out_rx) = mpsc::channel::<TransportCommand>(256);
    let gateway = RealtimeGateway::new(
        &call_sid,
        state.gateway.clone(),
        profile,
        memory,
        Arc::new(recognizer),
        generator,
        synthesizer,
        broker,
        out_tx,
    );
    gateway.start(stt_events).await;

    // Egress: gateway commands become wire frames.
    let egress_sid = stream_sid.clone();
    let egress = tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            let frame = match command {
                TransportCommand::Media { payload, .. } => {
                    telephony::media_frame(&egress_sid, &payload)
                }
                TransportCommand::Clear => telephony::clear_frame(&egress_sid),
            };
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Greet in the background so inbound frames (and barge-in) keep flowing.
    let greeter = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway.greet().await;
        })
    };

    // Ingest: caller frames into the gateway until the stream stops.
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match telephony::parse_inbound(&text) {
                Ok(StreamInbound::Media { media }) => {
                    gateway.receive_frame(&media.payload).await;
                }
                Ok(StreamInbound::Stop) => {
                    info!(target: "companion::server", call_id = %call_sid, "stop event received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(target: "companion::server", call_id = %call_sid, error = %e, "malformed frame dropped");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(target: "companion::server", call_id = %call_sid, error = %e, "transport receive error");
                break;
            }
        }
    }

    greeter.abort();
    let transcript = gateway.stop().await;
    egress.abort();

    // The full conversation goes to the post-call pipeline; only its size is
    // logged here.
    info!(
        target: "companion::server",
        call_id = %call_sid,
        transcript_chars = transcript.chars().count(),
        "call ended, transcript handed off"
    );
    Ok(())
}
