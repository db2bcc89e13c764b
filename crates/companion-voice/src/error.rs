//! Error types for the voice gateway.

use thiserror::Error;

/// Result type alias for gateway operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice gateway.
///
/// Only `Transport` and `Stt` are fatal to a session; everything else is
/// recovered locally by the state machine (the turn is dropped or degraded,
/// the call continues).
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("recognizer error: {0}")]
    Stt(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("tool timed out after {0} ms")]
    ToolTimeout(u64),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
