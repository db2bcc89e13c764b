//! Tuning parameters for the gateway and its three provider clients.
//!
//! Every value has a working default; `from_env()` readers pick up the
//! deployment's `.env` overrides so behavior changes without code edits.

use crate::error::{VoiceError, VoiceResult};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Turn-taking and barge-in tuning for the state machine.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | END_OF_TURN_SILENCE_MS | 750 | recognizer endpointing threshold |
/// | MIN_UTTERANCE_MS | 600 | utterances shorter than this wait for more |
/// | MAX_UTTERANCE_MS | 15000 | utterances longer than this are processed immediately |
/// | BARGE_IN_THRESHOLD_MS | 150 | VAD debounce window |
/// | VAD_ENERGY_THRESHOLD | 1200 | RMS cutoff on the 0..32767 scale |
/// | MIN_AUDIO_BEFORE_BARGEIN | 20 | chunks sent before barge-in is allowed (~400ms) |
/// | SHORT_BUFFER_MAX_TURNS | 6 | conversation history bound |
/// | TOOL_TIMEOUT_MS | 5000 | tool-broker hard deadline |
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server-side endpointing: silence before the recognizer declares end of turn.
    pub end_of_turn_silence_ms: u64,
    /// Utterances with less recognized audio than this are held open.
    pub min_utterance_ms: u64,
    /// Utterances with more recognized audio than this are committed on the next final.
    pub max_utterance_ms: u64,
    /// Debounce window for energy-based barge-in detection.
    pub barge_in_threshold_ms: u64,
    /// RMS cutoff above which a 20ms frame counts as voiced.
    pub vad_energy_threshold: f32,
    /// Outbound chunks that must be sent before caller energy counts as barge-in.
    pub min_audio_before_bargein: u64,
    /// Most recent turns kept as dialogue context for the generator.
    pub short_buffer_max_turns: usize,
    /// Hard deadline for a single tool execution.
    pub tool_timeout_ms: u64,
    /// Single-word fillers that do not end a turn on their own.
    pub filler_words: Vec<String>,
    /// Transcript role labels: (caller, agent).
    pub transcript_labels: (String, String),
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            end_of_turn_silence_ms: 750,
            min_utterance_ms: 600,
            max_utterance_ms: 15_000,
            barge_in_threshold_ms: 150,
            vad_energy_threshold: 1200.0,
            min_audio_before_bargein: 20,
            short_buffer_max_turns: 6,
            tool_timeout_ms: 5000,
            filler_words: [
                "und", "aber", "also", "naja", "hmm", "ähm", "öhm", "na", "so", "äh",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            transcript_labels: ("Anrufer".to_string(), "Begleiter".to_string()),
        }
    }
}

impl GatewayConfig {
    /// Load tuning overrides from environment; unset keys keep the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            end_of_turn_silence_ms: env_u64("END_OF_TURN_SILENCE_MS", d.end_of_turn_silence_ms),
            min_utterance_ms: env_u64("MIN_UTTERANCE_MS", d.min_utterance_ms),
            max_utterance_ms: env_u64("MAX_UTTERANCE_MS", d.max_utterance_ms),
            barge_in_threshold_ms: env_u64("BARGE_IN_THRESHOLD_MS", d.barge_in_threshold_ms),
            vad_energy_threshold: env_f32("VAD_ENERGY_THRESHOLD", d.vad_energy_threshold),
            min_audio_before_bargein: env_u64(
                "MIN_AUDIO_BEFORE_BARGEIN",
                d.min_audio_before_bargein,
            ),
            short_buffer_max_turns: env_u64(
                "SHORT_BUFFER_MAX_TURNS",
                d.short_buffer_max_turns as u64,
            ) as usize,
            tool_timeout_ms: env_u64("TOOL_TIMEOUT_MS", d.tool_timeout_ms),
            ..d
        }
    }

    /// Voiced 20ms frames required before energy counts as barge-in.
    /// The default window (150ms) maps to 3 consecutive frames (~60ms of
    /// voiced energy inside the window).
    pub fn barge_in_debounce_frames(&self) -> u32 {
        ((self.barge_in_threshold_ms / 50).max(1)) as u32
    }
}

/// Streaming recognizer connection settings.
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// WebSocket endpoint without query string.
    pub endpoint: String,
    /// Bearer API key.
    pub api_key: String,
    /// Recognizer model.
    pub model: String,
    /// Language tag pushed at connect time.
    pub language: String,
    /// Server-side endpointing threshold in ms.
    pub endpointing_ms: u64,
    /// Keepalive interval to prevent server-side idle timeout.
    pub keepalive_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
            api_key: String::new(),
            model: "nova-2".to_string(),
            language: "de".to_string(),
            endpointing_ms: 750,
            keepalive_secs: 10,
        }
    }
}

impl SttConfig {
    /// Build from environment: STT_API_KEY (or DEEPGRAM_API_KEY), STT_MODEL, STT_LANGUAGE.
    pub fn from_env(endpointing_ms: u64) -> VoiceResult<Self> {
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("DEEPGRAM_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("recognizer requires STT_API_KEY or DEEPGRAM_API_KEY".into())
            })?;
        let d = Self::default();
        Ok(Self {
            endpoint: env_string("STT_ENDPOINT", &d.endpoint),
            api_key,
            model: env_string("STT_MODEL", &d.model),
            language: env_string("STT_LANGUAGE", &d.language),
            endpointing_ms,
            keepalive_secs: env_u64("STT_KEEPALIVE_SECS", d.keepalive_secs),
        })
    }
}

/// Streaming text-generator settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Chat model.
    pub model: String,
    pub temperature: f32,
    /// Token budget for a plain reply.
    pub base_max_tokens: u32,
    /// Budget when the input asks a question or is long (> 100 chars).
    pub question_max_tokens: u32,
    /// Budget when the input contains an explain keyword.
    pub explain_max_tokens: u32,
    /// Budget for the reply that incorporates a tool result.
    pub tool_reply_max_tokens: u32,
    /// Keywords (conversation language) that widen the budget to `explain_max_tokens`.
    pub explain_keywords: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            temperature: 0.6,
            base_max_tokens: 120,
            question_max_tokens: 180,
            explain_max_tokens: 220,
            tool_reply_max_tokens: 250,
            explain_keywords: ["erzähl", "warum", "wie", "erkläre"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl LlmConfig {
    /// Build from environment: LLM_API_KEY (or OPENAI_API_KEY), LLM_BASE_URL, LLM_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("generator requires LLM_API_KEY or OPENAI_API_KEY".into())
            })?;
        let d = Self::default();
        Ok(Self {
            base_url: env_string("LLM_BASE_URL", &d.base_url),
            api_key,
            model: env_string("LLM_MODEL", &d.model),
            temperature: env_f32("LLM_TEMPERATURE", d.temperature),
            ..d
        })
    }
}

/// Synthesizer voice tuning. The numeric ranges are dictated by the provider;
/// these defaults favor natural conversational German at a slightly slower pace.
#[derive(Debug, Clone)]
pub struct VoiceTuning {
    /// 0..1, balance between consistency and emotion.
    pub stability: f32,
    /// 0..1, similarity/clarity factor.
    pub similarity_boost: f32,
    /// 0..1, expressiveness.
    pub style: f32,
    pub use_speaker_boost: bool,
    /// Optional playback speed multiplier.
    pub speed: Option<f32>,
}

impl Default for VoiceTuning {
    fn default() -> Self {
        Self {
            stability: 0.45,
            similarity_boost: 0.70,
            style: 0.15,
            use_speaker_boost: true,
            speed: Some(0.85),
        }
    }
}

/// Streaming synthesizer settings.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Provider API key.
    pub api_key: String,
    /// Voice identifier.
    pub voice_id: String,
    /// Synthesis model.
    pub model_id: String,
    pub tuning: VoiceTuning,
    /// Outbound chunk size in μ-law bytes (~100ms at 8kHz).
    pub chunk_bytes: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            api_key: String::new(),
            voice_id: "nGISSznGHAgSTKaMXEPO".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            tuning: VoiceTuning::default(),
            chunk_bytes: 800,
        }
    }
}

impl TtsConfig {
    /// Build from environment: TTS_API_KEY (or ELEVENLABS_API_KEY), TTS_VOICE_ID, TTS_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("ELEVENLABS_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("synthesizer requires TTS_API_KEY or ELEVENLABS_API_KEY".into())
            })?;
        let d = Self::default();
        Ok(Self {
            base_url: env_string("TTS_BASE_URL", &d.base_url),
            api_key,
            voice_id: env_string("TTS_VOICE_ID", &d.voice_id),
            model_id: env_string("TTS_MODEL", &d.model_id),
            tuning: VoiceTuning {
                stability: env_f32("TTS_STABILITY", d.tuning.stability),
                similarity_boost: env_f32("TTS_SIMILARITY_BOOST", d.tuning.similarity_boost),
                style: env_f32("TTS_STYLE", d.tuning.style),
                use_speaker_boost: d.tuning.use_speaker_boost,
                speed: Some(env_f32("TTS_SPEED", d.tuning.speed.unwrap_or(1.0))),
            },
            chunk_bytes: d.chunk_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_defaults_match_tuning_table() {
        let c = GatewayConfig::default();
        assert_eq!(c.end_of_turn_silence_ms, 750);
        assert_eq!(c.min_utterance_ms, 600);
        assert_eq!(c.max_utterance_ms, 15_000);
        assert_eq!(c.barge_in_threshold_ms, 150);
        assert!((c.vad_energy_threshold - 1200.0).abs() < f32::EPSILON);
        assert_eq!(c.min_audio_before_bargein, 20);
        assert_eq!(c.short_buffer_max_turns, 6);
        assert_eq!(c.tool_timeout_ms, 5000);
    }

    #[test]
    fn default_debounce_is_three_frames() {
        let c = GatewayConfig::default();
        assert_eq!(c.barge_in_debounce_frames(), 3);
    }

    #[test]
    fn filler_words_are_single_tokens() {
        let c = GatewayConfig::default();
        assert!(c.filler_words.iter().all(|w| !w.contains(' ')));
        assert!(c.filler_words.contains(&"und".to_string()));
        // "ja" is intentionally absent: it is often a complete answer.
        assert!(!c.filler_words.contains(&"ja".to_string()));
    }
}
