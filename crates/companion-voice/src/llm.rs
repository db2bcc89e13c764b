//! Streaming text-generator client.
//!
//! Builds the request from three layers: the fixed persona system message,
//! the context dossier computed once per session from profile and memory
//! (injected as a synthetic caller message plus a synthetic agent
//! acknowledgment, so the model treats it as processed conversation rather
//! than system boilerplate), and the short buffer of recent turns.
//!
//! Output is consumed token-by-token from the server-sent-event stream and
//! chunked at sentence boundaries for the synthesizer. A tool-call request
//! is accumulated from argument fragments and returned instead of text.

use crate::config::LlmConfig;
use crate::context::{ConversationTurn, MemoryState, PersonProfile, Role};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Persona system message. The agent is a warm German-speaking telephone
/// companion; replies are short spoken sentences, never service phrases.
const SYSTEM_PROMPT: &str = "\
Du bist VIOLA, eine deutschsprachige, sprachbasierte digitale Begleiterin. \
Du sprichst wie eine echte Freundin am Telefon - warm, interessiert, natürlich.

WERKZEUGE: Du hast Zugriff auf aktuelle Nachrichten. Nutze das get_news Tool, \
wenn der Nutzer nach Neuigkeiten, Schlagzeilen oder dem Weltgeschehen fragt. \
Fasse Nachrichten kurz zusammen (1-2 Sätze pro Meldung) und frag danach, ob \
der Nutzer mehr zu einem Thema wissen möchte.

GESPRÄCH AM LEBEN HALTEN: Du führst ein echtes Gespräch, keinen \
Kundenservice-Call. Niemals sagen: \"Gibt es sonst noch etwas?\", \"Kann ich \
dir noch irgendwie helfen?\" oder ähnliche Abschlussfloskeln. Stelle \
stattdessen Folgefragen, teile kurze eigene Gedanken, wechsle natürlich zu \
verwandten Themen.

NATÜRLICHKEIT: Variiere stark - manchmal Filler (\"Hmm...\", \"Ach...\", \
\"Na sowas!\"), manchmal nicht; manchmal Frage, manchmal Aussage; niemals \
dieselbe Struktur zweimal hintereinander.

KERNREGELN:
1) Reagiere auf das, was gesagt wurde - nicht auf Vermutungen.
2) Emotionale Intensität etwas niedriger als beim Nutzer.
3) Kurze, natürliche Sätze - wie gesprochen, nicht geschrieben.
4) Wiederhole keine Fragen, die schon beantwortet wurden.
5) Nutze den Gesprächsverlauf und beziehe dich auf frühere Themen.

Halte Antworten kurz (1-2 Sätze), aber zeige immer Interesse weiterzureden!";

static SENTENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^.!?]*[.!?])(?:\s|$)").expect("sentence pattern"));

/// A named side-effect the model wants executed mid-turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: serde_json::Value,
    pub call_id: String,
}

/// What a generation produced: plain text, or a tool call to run first.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmOutcome {
    Text(String),
    ToolCall(ToolCallRequest),
}

/// Capability interface for the generator. Complete sentences are pushed
/// through `sentence_tx` as they form; the full text (or tool request)
/// comes back when the stream ends. `cancel()` is cooperative and
/// idempotent: the receive loop checks the flag at every streamed chunk.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<LlmOutcome>;

    async fn continue_with_tool_result(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        call: &ToolCallRequest,
        tool_result: &str,
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<String>;

    fn cancel(&self);
}

/// Split a stream buffer into complete sentences and the unfinished
/// remainder. A sentence is a run of non-terminator characters followed by
/// `.`, `!` or `?` and then whitespace or end of buffer.
pub fn extract_sentences(buffer: &str) -> (Vec<String>, String) {
    let mut complete = Vec::new();
    let mut last_end = 0;
    for caps in SENTENCE_RE.captures_iter(buffer) {
        let sentence = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !sentence.is_empty() {
            complete.push(sentence.to_string());
        }
        if let Some(whole) = caps.get(0) {
            last_end = whole.end();
        }
    }
    (complete, buffer[last_end..].trim_start().to_string())
}

/// Build the context dossier: an authoritative known/unknown briefing
/// rendered as a synthetic caller message plus the agent's acknowledgment.
pub fn context_dossier(profile: &PersonProfile, memory: &MemoryState) -> (String, String) {
    let mut sections = Vec::new();

    // 1. Identity.
    let mut identity = String::from("1. Wer ich bin: ");
    match profile.first_name() {
        Some(name) => identity.push_str(&format!("Ich heiße {name}.")),
        None => identity.push_str("Mein Name ist dir nicht bekannt."),
    }
    if let Some(age) = profile.age {
        identity.push_str(&format!(" Ich bin {age} Jahre alt."));
    }
    identity.push_str(" Du bist meine digitale Begleiterin am Telefon.");
    sections.push(identity);

    // 2. Known facts, from profile fields and long-term memory.
    let mut known = Vec::new();
    for (field, label) in [
        ("interests", "Interessen"),
        ("important_people", "Wichtige Menschen"),
        ("routines", "Gewohnheiten"),
        ("preferred_topics", "Lieblingsthemen"),
        ("description", "Über mich"),
    ] {
        if let Some(value) = profile.fields.get(field) {
            if !value.trim().is_empty() {
                known.push(format!("{label}: {value}"));
            }
        }
    }
    for (key, label) in [
        ("facts", "Fakten"),
        ("preferences", "Vorlieben"),
        ("important_people", "Wichtige Personen"),
        ("health_notes", "Gesundheit"),
        ("mood_indicator", "Stimmung zuletzt"),
    ] {
        let items = memory.string_list(key, 10);
        if !items.is_empty() {
            known.push(format!("{label}: {}", items.join(", ")));
        }
    }
    if known.is_empty() {
        sections.push("2. Was du über mich weißt: bisher nichts.".to_string());
    } else {
        sections.push(format!("2. Was du über mich weißt: {}", known.join(" | ")));
    }

    // 3. Explicit unknowns - the model must admit these instead of guessing.
    let mut unknown = Vec::new();
    for (key, label) in [
        ("facts", "Fakten über mein Leben"),
        ("preferences", "meine Vorlieben"),
        ("important_people", "Menschen in meinem Leben"),
        ("health_notes", "meine Gesundheit"),
    ] {
        if memory.string_list(key, 1).is_empty() {
            unknown.push(label);
        }
    }
    if !unknown.is_empty() {
        sections.push(format!(
            "3. Was du NICHT weißt: {}. Wenn ich danach frage, gib ehrlich zu, \
             dass du es nicht weißt - erfinde nichts.",
            unknown.join(", ")
        ));
    }

    // 4. Recent topics, for continuity.
    let topics = memory.string_list("recent_topics", 5);
    if !topics.is_empty() {
        sections.push(format!(
            "4. Unsere letzten Gesprächsthemen: {}.",
            topics.join(", ")
        ));
    }

    // 5. Hard-avoid list.
    if let Some(sensitive) = profile.fields.get("sensitive_topics") {
        if !sensitive.trim().is_empty() {
            sections.push(format!(
                "5. Sensible Themen, die du strikt vermeidest: {sensitive}."
            ));
        }
    }

    let user = format!(
        "Bevor wir richtig loslegen - hier ist, was du über mich weißt und was nicht:\n{}",
        sections.join("\n")
    );
    let ack = "Verstanden. Ich weiß jetzt, was ich über dich weiß, gebe offen zu, \
               was ich nicht weiß, und halte mich von den sensiblen Themen fern. \
               Erzähl mal - wie geht es dir?"
        .to_string();
    (user, ack)
}

// Server-sent-event chunk payloads; tool-call arguments arrive in fragments.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct StreamResult {
    full_text: String,
    tool_id: String,
    tool_name: String,
    tool_args: String,
    cancelled: bool,
}

/// Streaming chat-completion client.
pub struct StreamingGenerator {
    config: LlmConfig,
    call_id: String,
    client: reqwest::Client,
    /// Synthetic caller/agent exchange computed at session start.
    preamble: Option<(String, String)>,
    /// Tool schemas offered to the model (chat-completion function format).
    tools: Vec<serde_json::Value>,
    cancelled: Arc<AtomicBool>,
}

impl StreamingGenerator {
    pub fn new(config: LlmConfig, call_id: impl Into<String>) -> Self {
        Self {
            config,
            call_id: call_id.into(),
            client: reqwest::Client::new(),
            preamble: None,
            tools: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Compute the context dossier from the caller's profile and memory.
    pub fn with_context(mut self, profile: &PersonProfile, memory: &MemoryState) -> Self {
        self.preamble = Some(context_dossier(profile, memory));
        self
    }

    /// Offer tool schemas to the model.
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Adaptive token budget: explain-requests get the most room, questions
    /// and long inputs a bit more than the base.
    fn max_tokens_for(&self, input: &str) -> u32 {
        let lower = input.to_lowercase();
        if self
            .config
            .explain_keywords
            .iter()
            .any(|k| lower.contains(k.as_str()))
        {
            return self.config.explain_max_tokens;
        }
        if input.contains('?') || input.chars().count() > 100 {
            return self.config.question_max_tokens;
        }
        self.config.base_max_tokens
    }

    fn build_messages(&self, user_text: &str, history: &[ConversationTurn]) -> Vec<serde_json::Value> {
        let mut messages = vec![json!({"role": "system", "content": SYSTEM_PROMPT})];
        if let Some((dossier, ack)) = &self.preamble {
            messages.push(json!({"role": "user", "content": dossier}));
            messages.push(json!({"role": "assistant", "content": ack}));
        }
        for turn in history {
            let role = match turn.role {
                Role::Caller => "user",
                Role::Agent => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": user_text}));
        messages
    }

    async fn open_stream(&self, body: serde_json::Value) -> VoiceResult<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Generation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "upstream {status}: {detail}"
            )));
        }
        Ok(response)
    }

    /// Drain the SSE stream: emit complete sentences, accumulate tool-call
    /// fragments, honor the cancellation flag at every chunk.
    async fn consume_stream(
        &self,
        response: reqwest::Response,
        sentence_tx: &mpsc::Sender<String>,
    ) -> VoiceResult<StreamResult> {
        let mut result = StreamResult::default();
        let mut sentence_buffer = String::new();
        let mut line_buffer = String::new();
        let mut byte_stream = response.bytes_stream();

        'stream: while let Some(chunk) = byte_stream.next().await {
            if self.cancelled.load(Ordering::SeqCst) {
                debug!(target: "companion::llm", call_id = %self.call_id, "generation cancelled");
                result.cancelled = true;
                break;
            }
            let chunk =
                chunk.map_err(|e| VoiceError::Generation(format!("stream read failed: {e}")))?;
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'stream;
                }
                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(target: "companion::llm", call_id = %self.call_id, error = %e, "unparseable stream chunk");
                        continue;
                    }
                };
                let Some(choice) = parsed.choices.into_iter().next() else {
                    continue;
                };

                if let Some(tool_calls) = choice.delta.tool_calls {
                    if let Some(tc) = tool_calls.into_iter().next() {
                        if let Some(id) = tc.id {
                            result.tool_id = id;
                        }
                        if let Some(function) = tc.function {
                            if let Some(name) = function.name {
                                result.tool_name = name;
                            }
                            if let Some(fragment) = function.arguments {
                                result.tool_args.push_str(&fragment);
                            }
                        }
                    }
                } else if let Some(token) = choice.delta.content {
                    result.full_text.push_str(&token);
                    sentence_buffer.push_str(&token);

                    let (complete, rest) = extract_sentences(&sentence_buffer);
                    if !complete.is_empty() {
                        for sentence in complete {
                            if self.cancelled.load(Ordering::SeqCst) {
                                result.cancelled = true;
                                break 'stream;
                            }
                            if sentence_tx.send(sentence).await.is_err() {
                                // Consumer gone; stop emitting.
                                result.cancelled = true;
                                break 'stream;
                            }
                        }
                        sentence_buffer = rest;
                    }
                }
            }
        }

        // Remainder on stream close is a final sentence if non-empty.
        let remainder = sentence_buffer.trim();
        if !remainder.is_empty() && !result.cancelled && result.tool_name.is_empty() {
            let _ = sentence_tx.send(remainder.to_string()).await;
        }

        Ok(result)
    }
}

#[async_trait]
impl TextGenerator for StreamingGenerator {
    async fn generate(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<LlmOutcome> {
        self.cancelled.store(false, Ordering::SeqCst);

        let mut body = json!({
            "model": self.config.model,
            "messages": self.build_messages(user_text, history),
            "temperature": self.config.temperature,
            "max_tokens": self.max_tokens_for(user_text),
            "stream": true,
        });
        if !self.tools.is_empty() {
            body["tools"] = json!(self.tools);
            body["tool_choice"] = json!("auto");
        }

        let response = self.open_stream(body).await?;
        let result = self.consume_stream(response, &sentence_tx).await?;

        if !result.tool_name.is_empty() {
            let args = if result.tool_args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&result.tool_args).unwrap_or_else(|e| {
                    warn!(target: "companion::llm", call_id = %self.call_id, error = %e, "tool arguments not valid JSON");
                    json!({})
                })
            };
            info!(target: "companion::llm", call_id = %self.call_id, tool = %result.tool_name, "tool call requested");
            return Ok(LlmOutcome::ToolCall(ToolCallRequest {
                name: result.tool_name,
                args,
                call_id: result.tool_id,
            }));
        }

        Ok(LlmOutcome::Text(result.full_text.trim().to_string()))
    }

    async fn continue_with_tool_result(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
        call: &ToolCallRequest,
        tool_result: &str,
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<String> {
        self.cancelled.store(false, Ordering::SeqCst);

        let mut messages = self.build_messages(user_text, history);
        messages.push(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": call.call_id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.args.to_string(),
                }
            }]
        }));
        messages.push(json!({
            "role": "tool",
            "tool_call_id": call.call_id,
            "content": tool_result,
        }));

        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.tool_reply_max_tokens,
            "stream": true,
        });

        let response = self.open_stream(body).await?;
        let result = self.consume_stream(response, &sentence_tx).await?;
        Ok(result.full_text.trim().to_string())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
