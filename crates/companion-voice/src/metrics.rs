//! Per-turn latency metrics and call-scope counters.
//!
//! Every turn is timestamped at the interesting points (speech start/end,
//! recognizer final, generator start/first token/complete, synthesizer
//! start/first audio/complete) and logged as a structured record on turn
//! end. Records carry numbers and the call identifier only - never
//! transcribed text, never caller PII.

use serde_json::json;
use std::time::Instant;
use tracing::info;

fn ms_between(start: Option<Instant>, end: Option<Instant>) -> f64 {
    match (start, end) {
        (Some(s), Some(e)) if e >= s => e.duration_since(s).as_secs_f64() * 1000.0,
        _ => 0.0,
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Timing points for a single conversation turn.
#[derive(Debug, Clone, Default)]
pub struct TurnMetrics {
    pub turn_id: u64,
    user_speech_start: Option<Instant>,
    user_speech_end: Option<Instant>,
    stt_final_received: Option<Instant>,
    llm_request_start: Option<Instant>,
    llm_first_token: Option<Instant>,
    llm_complete: Option<Instant>,
    tts_request_start: Option<Instant>,
    tts_first_audio: Option<Instant>,
    tts_complete: Option<Instant>,
}

impl TurnMetrics {
    /// Time from end of caller speech to the final transcript.
    pub fn stt_latency_ms(&self) -> f64 {
        ms_between(self.user_speech_end, self.stt_final_received)
    }

    /// Generator time-to-first-byte.
    pub fn llm_ttfb_ms(&self) -> f64 {
        ms_between(self.llm_request_start, self.llm_first_token)
    }

    pub fn llm_total_ms(&self) -> f64 {
        ms_between(self.llm_request_start, self.llm_complete)
    }

    /// Synthesizer time-to-first-byte.
    pub fn tts_ttfb_ms(&self) -> f64 {
        ms_between(self.tts_request_start, self.tts_first_audio)
    }

    /// End of caller speech to first agent audio - the latency the caller feels.
    pub fn total_turn_latency_ms(&self) -> f64 {
        ms_between(self.user_speech_end, self.tts_first_audio)
    }

    fn to_record(&self, call_id: &str) -> serde_json::Value {
        json!({
            "call_id": call_id,
            "turn_id": self.turn_id,
            "stt_latency_ms": round1(self.stt_latency_ms()),
            "llm_ttfb_ms": round1(self.llm_ttfb_ms()),
            "llm_total_ms": round1(self.llm_total_ms()),
            "tts_ttfb_ms": round1(self.tts_ttfb_ms()),
            "total_turn_latency_ms": round1(self.total_turn_latency_ms()),
        })
    }
}

/// Metrics for an entire call session.
#[derive(Debug)]
pub struct CallMetrics {
    call_id: String,
    call_start: Instant,
    call_end: Option<Instant>,
    turns: Vec<TurnMetrics>,
    current: Option<TurnMetrics>,
    pub barge_in_count: u64,
    pub partial_count: u64,
    pub final_count: u64,
    pub llm_token_count: u64,
    pub tts_char_count: u64,
}

impl CallMetrics {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            call_start: Instant::now(),
            call_end: None,
            turns: Vec::new(),
            current: None,
            barge_in_count: 0,
            partial_count: 0,
            final_count: 0,
            llm_token_count: 0,
            tts_char_count: 0,
        }
    }

    /// Begin timing a new turn; any unfinished turn is discarded.
    pub fn start_turn(&mut self) {
        let turn_id = self.turns.len() as u64 + 1;
        self.current = Some(TurnMetrics {
            turn_id,
            user_speech_start: Some(Instant::now()),
            ..Default::default()
        });
    }

    pub fn end_user_speech(&mut self) {
        if let Some(t) = self.current.as_mut() {
            t.user_speech_end = Some(Instant::now());
        }
    }

    pub fn stt_final(&mut self) {
        self.final_count += 1;
        if let Some(t) = self.current.as_mut() {
            t.stt_final_received = Some(Instant::now());
        }
    }

    pub fn stt_partial(&mut self) {
        self.partial_count += 1;
    }

    pub fn llm_start(&mut self) {
        if let Some(t) = self.current.as_mut() {
            t.llm_request_start = Some(Instant::now());
        }
    }

    pub fn llm_first_token(&mut self) {
        if let Some(t) = self.current.as_mut() {
            if t.llm_first_token.is_none() {
                t.llm_first_token = Some(Instant::now());
            }
        }
    }

    pub fn llm_complete(&mut self) {
        if let Some(t) = self.current.as_mut() {
            t.llm_complete = Some(Instant::now());
        }
    }

    pub fn tts_start(&mut self) {
        if let Some(t) = self.current.as_mut() {
            if t.tts_request_start.is_none() {
                t.tts_request_start = Some(Instant::now());
            }
        }
    }

    pub fn tts_first_audio(&mut self) {
        if let Some(t) = self.current.as_mut() {
            if t.tts_first_audio.is_none() {
                t.tts_first_audio = Some(Instant::now());
            }
        }
    }

    pub fn tts_complete(&mut self) {
        if let Some(t) = self.current.as_mut() {
            t.tts_complete = Some(Instant::now());
        }
    }

    pub fn add_llm_tokens(&mut self, count: u64) {
        self.llm_token_count += count;
    }

    pub fn add_tts_chars(&mut self, count: u64) {
        self.tts_char_count += count;
    }

    pub fn record_barge_in(&mut self) {
        self.barge_in_count += 1;
        info!(
            target: "companion::metrics",
            call_id = %self.call_id,
            barge_in_count = self.barge_in_count,
            "barge_in"
        );
    }

    /// Finalize the current turn and emit its structured record.
    pub fn end_turn(&mut self) {
        if let Some(turn) = self.current.take() {
            info!(
                target: "companion::metrics",
                record = %turn.to_record(&self.call_id),
                "turn_complete"
            );
            self.turns.push(turn);
        }
    }

    pub fn end_call(&mut self) {
        self.call_end = Some(Instant::now());
        info!(
            target: "companion::metrics",
            record = %self.summary(),
            "call_complete"
        );
    }

    pub fn turns_completed(&self) -> usize {
        self.turns.len()
    }

    /// Call-scope summary: numbers and the call identifier only.
    pub fn summary(&self) -> serde_json::Value {
        let duration_sec = self
            .call_end
            .unwrap_or_else(Instant::now)
            .duration_since(self.call_start)
            .as_secs_f64();
        let latencies: Vec<f64> = self
            .turns
            .iter()
            .map(TurnMetrics::total_turn_latency_ms)
            .filter(|&l| l > 0.0)
            .collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        json!({
            "call_id": self.call_id,
            "duration_sec": round1(duration_sec),
            "total_turns": self.turns.len(),
            "barge_in_count": self.barge_in_count,
            "avg_turn_latency_ms": round1(avg_latency),
            "stt_partials": self.partial_count,
            "stt_finals": self.final_count,
            "llm_tokens": self.llm_token_count,
            "tts_chars": self.tts_char_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn latencies_derive_from_marks() {
        let now = Instant::now();
        let turn = TurnMetrics {
            turn_id: 1,
            user_speech_end: Some(now),
            stt_final_received: Some(now + Duration::from_millis(120)),
            llm_request_start: Some(now + Duration::from_millis(130)),
            llm_first_token: Some(now + Duration::from_millis(380)),
            llm_complete: Some(now + Duration::from_millis(900)),
            tts_request_start: Some(now + Duration::from_millis(400)),
            tts_first_audio: Some(now + Duration::from_millis(700)),
            ..Default::default()
        };
        assert_eq!(turn.stt_latency_ms().round(), 120.0);
        assert_eq!(turn.llm_ttfb_ms().round(), 250.0);
        assert_eq!(turn.llm_total_ms().round(), 770.0);
        assert_eq!(turn.tts_ttfb_ms().round(), 300.0);
        assert_eq!(turn.total_turn_latency_ms().round(), 700.0);
    }

    #[test]
    fn missing_marks_yield_zero() {
        let turn = TurnMetrics::default();
        assert_eq!(turn.stt_latency_ms(), 0.0);
        assert_eq!(turn.total_turn_latency_ms(), 0.0);
    }

    #[test]
    fn first_marks_are_sticky() {
        let mut m = CallMetrics::new("CA1");
        m.start_turn();
        m.llm_first_token();
        let first = m.current.as_ref().unwrap().llm_first_token;
        m.llm_first_token();
        assert_eq!(m.current.as_ref().unwrap().llm_first_token, first);
    }

    #[test]
    fn turn_ids_count_up_from_one() {
        let mut m = CallMetrics::new("CA1");
        m.start_turn();
        m.end_turn();
        m.start_turn();
        m.end_turn();
        assert_eq!(m.turns_completed(), 2);
        assert_eq!(m.turns[0].turn_id, 1);
        assert_eq!(m.turns[1].turn_id, 2);
    }

    #[test]
    fn summary_contains_no_text_fields() {
        let mut m = CallMetrics::new("CA1");
        m.start_turn();
        m.record_barge_in();
        m.end_turn();
        m.end_call();
        let summary = m.summary();
        let object = summary.as_object().unwrap();
        for (key, value) in object {
            if key == "call_id" {
                continue;
            }
            assert!(value.is_number(), "summary field {key} must be numeric");
        }
        assert_eq!(summary["barge_in_count"], 1);
        assert_eq!(summary["total_turns"], 1);
    }
}
