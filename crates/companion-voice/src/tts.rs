//! Streaming speech synthesizer client.
//!
//! POSTs a text fragment and streams the response body back as μ-law 8kHz
//! chunks, base64-framed for the transport. Output format is fixed to
//! μ-law so nothing needs converting on the way out. Cancellation drops the
//! in-flight response body, which terminates the iteration with no further
//! chunk deliveries.

use crate::audio;
use crate::config::TtsConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capability interface for the synthesizer. Chunks are base64 μ-law,
/// delivered in order through `chunk_tx`. `cancel()` is cooperative and
/// takes effect at the next chunk boundary.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, chunk_tx: mpsc::Sender<String>) -> VoiceResult<()>;
    fn cancel(&self);
}

/// German coordinating and subordinating conjunctions that make natural
/// split and breathing points in long sentences.
const BREATH_CONJUNCTIONS: [&str; 7] = ["und", "aber", "oder", "denn", "weil", "dass", "sondern"];

/// Words above which a sentence is broken in two at a conjunction boundary.
const LONG_SENTENCE_WORDS: usize = 20;

/// Words above which remaining conjunctions get a breathing comma.
const BREATHING_MIN_WORDS: usize = 12;

/// Prepare text for speech: strip stage directions, drop characters the
/// voice cannot speak, split run-on sentences at conjunction boundaries,
/// insert commas at breathing points, collapse whitespace.
pub fn preprocess_for_speech(text: &str) -> String {
    // Stage directions like [lacht] or (seufzt) are written, not spoken.
    let mut cleaned = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => cleaned.push(c),
            _ => {}
        }
    }

    // Keep letters, digits, whitespace and spoken punctuation.
    let cleaned: String = cleaned
        .chars()
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '.' | ',' | '!' | '?' | ';' | ':' | '-' | '\'' | '…')
        })
        .collect();

    let mut out = Vec::new();
    for sentence in split_sentences(&cleaned) {
        for part in split_long_sentence(sentence) {
            out.push(insert_breathing_commas(&part));
        }
    }
    out.join(" ")
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Break a sentence exceeding the word bound in two at the conjunction
/// closest to its midpoint, recursing while the halves stay too long. The
/// first half is closed with a period so the synthesizer treats it as a
/// sentence of its own. Sentences with no usable conjunction stay whole.
fn split_long_sentence(sentence: String) -> Vec<String> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    if words.len() <= LONG_SENTENCE_WORDS {
        return vec![words.join(" ")];
    }

    let midpoint = words.len() / 2;
    let boundary = words
        .iter()
        .enumerate()
        .filter(|(i, word)| {
            *i >= 4
                && words.len() - *i >= 4
                && BREATH_CONJUNCTIONS.contains(&word.to_lowercase().as_str())
        })
        .min_by_key(|(i, _)| i.abs_diff(midpoint))
        .map(|(i, _)| i);
    let Some(split_at) = boundary else {
        return vec![words.join(" ")];
    };

    let mut first = words[..split_at].join(" ");
    while first.ends_with([',', ';', ':']) {
        first.pop();
    }
    if !first.ends_with(['.', '!', '?']) {
        first.push('.');
    }
    let second = words[split_at..].join(" ");

    let mut parts = split_long_sentence(first);
    parts.extend(split_long_sentence(second));
    parts
}

/// Put a comma before mid-sentence conjunctions so the voice pauses to
/// breathe. Only applied once a sentence is long enough that rushing
/// through it sounds unnatural.
fn insert_breathing_commas(sentence: &str) -> String {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    if words.len() <= BREATHING_MIN_WORDS {
        return words.join(" ");
    }
    let mut rebuilt: Vec<String> = Vec::with_capacity(words.len());
    for word in &words {
        let lower = word.to_lowercase();
        let is_conjunction = BREATH_CONJUNCTIONS.contains(&lower.as_str());
        if is_conjunction && rebuilt.len() >= 4 {
            if let Some(prev) = rebuilt.last_mut() {
                if !prev.ends_with([',', '.', '!', '?', ';', ':']) {
                    prev.push(',');
                }
            }
        }
        rebuilt.push((*word).to_string());
    }
    rebuilt.join(" ")
}

/// Streaming synthesizer over chunked HTTP.
pub struct StreamingSynthesizer {
    config: TtsConfig,
    call_id: String,
    client: reqwest::Client,
    cancelled: Arc<AtomicBool>,
}

impl StreamingSynthesizer {
    pub fn new(config: TtsConfig, call_id: impl Into<String>) -> Self {
        Self {
            config,
            call_id: call_id.into(),
            client: reqwest::Client::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for StreamingSynthesizer {
    async fn synthesize(&self, text: &str, chunk_tx: mpsc::Sender<String>) -> VoiceResult<()> {
        let text = preprocess_for_speech(text);
        if text.trim().is_empty() {
            return Ok(());
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let url = format!(
            "{}/text-to-speech/{}/stream",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id
        );

        let tuning = &self.config.tuning;
        let mut voice_settings = json!({
            "stability": tuning.stability,
            "similarity_boost": tuning.similarity_boost,
            "style": tuning.style,
            "use_speaker_boost": tuning.use_speaker_boost,
        });
        if let Some(speed) = tuning.speed {
            voice_settings["speed"] = json!(speed);
        }

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            // μ-law 8kHz straight from the provider; maximum streaming-latency optimization.
            .query(&[("output_format", "ulaw_8000"), ("optimize_streaming_latency", "4")])
            .json(&json!({
                "text": text,
                "model_id": self.config.model_id,
                "voice_settings": voice_settings,
            }))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("upstream {status}: {detail}")));
        }

        let chunk_bytes = self.config.chunk_bytes.max(1);
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes * 2);
        let mut total_bytes = 0usize;
        let mut byte_stream = response.bytes_stream();

        while let Some(piece) = byte_stream.next().await {
            if self.cancelled.load(Ordering::SeqCst) {
                // Dropping the stream here closes the response body.
                debug!(target: "companion::tts", call_id = %self.call_id, "synthesis cancelled mid-stream");
                return Ok(());
            }
            let piece =
                piece.map_err(|e| VoiceError::Synthesis(format!("stream read failed: {e}")))?;
            pending.extend_from_slice(&piece);

            while pending.len() >= chunk_bytes {
                let chunk: Vec<u8> = pending.drain(..chunk_bytes).collect();
                total_bytes += chunk.len();
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if chunk_tx.send(audio::encode_payload(&chunk)).await.is_err() {
                    return Ok(());
                }
            }
        }

        if !pending.is_empty() && !self.cancelled.load(Ordering::SeqCst) {
            total_bytes += pending.len();
            let _ = chunk_tx.send(audio::encode_payload(&pending)).await;
        }

        info!(
            target: "companion::tts",
            call_id = %self.call_id,
            bytes = total_bytes,
            chars = text.chars().count(),
            "synthesis complete"
        );
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
