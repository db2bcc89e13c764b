//! # Companion Voice - Realtime Voice Gateway
//!
//! Per-call orchestrator that bridges a telephony media stream (μ-law 8kHz
//! over WebSocket) to three streaming providers - a speech recognizer, a
//! text generator and a speech synthesizer - and runs a natural,
//! interruptible spoken conversation over them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Realtime Gateway                        │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────────────────┐  │
//! │  │ Transport │ → │ μ-law     │ → │ Energy VAD + STT      │  │
//! │  │ (WS in)   │   │ codec     │   │ (barge-in, turn end)  │  │
//! │  └───────────┘   └───────────┘   └───────────┬───────────┘  │
//! │        ↑                                     ↓              │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────────────────┐  │
//! │  │ Transport │ ← │ TTS       │ ← │ Turn state machine    │  │
//! │  │ (WS out)  │   │ (μ-law)   │   │ LISTENING ⇆ THINKING  │  │
//! │  └───────────┘   └───────────┘   │     → SPEAKING        │  │
//! │                                  └───────────┬───────────┘  │
//! │                                  ┌───────────┴───────────┐  │
//! │                                  │ LLM (sentences, tools)│  │
//! │                                  └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every outbound audio chunk is tagged with the turn id that produced it;
//! after a barge-in, stale chunks are dropped at the transport egress even
//! if their producer missed the cancellation flag.

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod metrics;
pub mod stt;
pub mod telephony;
pub mod tools;
pub mod tts;
pub mod vad;

pub use config::{GatewayConfig, LlmConfig, SttConfig, TtsConfig, VoiceTuning};
pub use context::{ConversationTurn, MemoryState, PersonProfile, Role, SessionContext};
pub use error::{VoiceError, VoiceResult};
pub use gateway::{GatewayState, RealtimeGateway, TransportCommand};
pub use llm::{LlmOutcome, StreamingGenerator, TextGenerator, ToolCallRequest};
pub use metrics::{CallMetrics, TurnMetrics};
pub use stt::{SpeechRecognizer, SttEvent, StreamingRecognizer, TranscriptEvent};
pub use tools::{NewsCategory, NewsTool, Tool, ToolBroker};
pub use tts::{SpeechSynthesizer, StreamingSynthesizer};
pub use vad::EnergyVad;
