//! The four-state turn machine coordinating recognizer, generator,
//! synthesizer and the caller transport.
//!
//! ```text
//!   IDLE → LISTENING ⇆ THINKING → SPEAKING → LISTENING
//!              ↑                      │
//!              └────── barge-in ──────┘
//! ```
//!
//! Turn discipline: every agent utterance runs under a turn identifier that
//! only ever increases. Audio chunks are tagged with the id of the turn that
//! produced them and the transport-send helper re-checks the tag against the
//! current id before egress, so a barge-in suppresses every stale chunk even
//! if a producer task missed the cancellation flag.

use crate::audio;
use crate::config::GatewayConfig;
use crate::context::{MemoryState, PersonProfile, Role, SessionContext};
use crate::error::{VoiceError, VoiceResult};
use crate::llm::{LlmOutcome, TextGenerator};
use crate::metrics::CallMetrics;
use crate::stt::{SpeechRecognizer, SttEvent, TranscriptEvent};
use crate::tools::{holding_phrase, ToolBroker};
use crate::tts::SpeechSynthesizer;
use crate::vad::EnergyVad;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Gateway states. Transitions are guarded by the session mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl GatewayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}

/// Commands handed to the transport egress. Every media chunk carries the
/// turn id that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Media { turn_id: u64, payload: String },
    /// Drop all queued, unplayed audio immediately.
    Clear,
}

/// Extra milliseconds of assumed network buffering when estimating when the
/// transport will have drained everything we sent.
const PLAYBACK_NETWORK_BUFFER_MS: u64 = 500;

struct Inner {
    state: GatewayState,
    context: SessionContext,
    metrics: CallMetrics,
    /// Utterance accumulator: finals appended here until end of turn.
    utterance: String,
    /// Text the recognizer caught during an interrupted agent turn;
    /// seeds the next utterance.
    staging: String,
    /// Recognized audio duration of the accumulating utterance.
    utterance_audio_ms: u64,
}

fn transition(inner: &mut Inner, call_id: &str, new: GatewayState) {
    if inner.state != new {
        info!(
            target: "companion::gateway",
            call_id = %call_id,
            from = inner.state.as_str(),
            to = new.as_str(),
            "state"
        );
        inner.state = new;
    }
}

/// Strip a 1-3 word overlap between the tail of the accumulated utterance
/// and the head of an incoming final (the recognizer rewinds to a word
/// boundary when emitting consecutive finals). Case-insensitive, ignoring
/// trailing punctuation.
pub fn strip_overlap(accumulated: &str, incoming: &str) -> String {
    fn norm(word: &str) -> String {
        word.trim_matches(|c: char| matches!(c, '.' | ',' | '!' | '?'))
            .to_lowercase()
    }

    let tail: Vec<&str> = accumulated.split_whitespace().collect();
    let head: Vec<&str> = incoming.split_whitespace().collect();
    let max_overlap = 3.min(tail.len()).min(head.len());

    for n in (1..=max_overlap).rev() {
        let tail_words = &tail[tail.len() - n..];
        let head_words = &head[..n];
        let matches = tail_words
            .iter()
            .zip(head_words)
            .all(|(a, b)| norm(a) == norm(b));
        if matches {
            return head[n..].join(" ");
        }
    }
    incoming.trim().to_string()
}

fn choose_greeting(first_name: Option<&str>) -> String {
    match first_name {
        Some(name) => {
            let variants = [
                format!("Hallo {name}! Hier ist Viola. Schön, dass du anrufst. Wie geht's dir?"),
                format!("Hey {name}! Viola hier. Na, wie läuft's bei dir?"),
                format!("Hallo {name}! Schön von dir zu hören. Was macht das Leben?"),
                format!("Hi {name}! Hier ist Viola. Wie geht es dir heute?"),
                format!("Hallo {name}! Freut mich, von dir zu hören. Alles gut bei dir?"),
                format!("Na {name}! Viola am Apparat. Wie geht's, wie steht's?"),
            ];
            variants
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| variants[0].clone())
        }
        None => {
            let variants = [
                "Hallo! Hier ist Viola. Schön, dass du anrufst. Wie geht's dir?",
                "Hey! Viola hier. Na, wie läuft's bei dir?",
                "Hallo! Schön von dir zu hören. Was macht das Leben?",
                "Hi! Hier ist Viola. Wie geht es dir heute?",
            ];
            (*variants.choose(&mut rand::thread_rng()).unwrap_or(&variants[0])).to_string()
        }
    }
}

/// One gateway instance per media-stream connection. Owns the session
/// context, the three provider clients and all turn bookkeeping; releases
/// everything on `stop()`.
pub struct RealtimeGateway {
    call_id: String,
    config: GatewayConfig,
    stt: Arc<dyn SpeechRecognizer>,
    llm: Arc<dyn TextGenerator>,
    tts: Arc<dyn SpeechSynthesizer>,
    broker: Arc<ToolBroker>,
    out_tx: mpsc::Sender<TransportCommand>,
    inner: Mutex<Inner>,
    /// Strictly monotonic; incremented exactly once per turn.
    turn_id: AtomicU64,
    /// Cooperative cancellation for the in-flight turn.
    cancelled: AtomicBool,
    /// Chunks sent out during the current speaking turn.
    audio_sent_count: AtomicU64,
    /// Wall-clock deadline after which the transport is believed to have
    /// drained everything we queued.
    playing_until: StdMutex<Instant>,
    /// Set when the recognizer or transport is gone; no further turns.
    degraded: AtomicBool,
    vad: StdMutex<EnergyVad>,
    turn_task: StdMutex<Option<JoinHandle<()>>>,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RealtimeGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: impl Into<String>,
        config: GatewayConfig,
        profile: PersonProfile,
        memory: MemoryState,
        stt: Arc<dyn SpeechRecognizer>,
        llm: Arc<dyn TextGenerator>,
        tts: Arc<dyn SpeechSynthesizer>,
        broker: Arc<ToolBroker>,
        out_tx: mpsc::Sender<TransportCommand>,
    ) -> Arc<Self> {
        let call_id = call_id.into();
        let vad = EnergyVad::new(
            config.vad_energy_threshold,
            config.barge_in_debounce_frames(),
        );
        let context = SessionContext::new(
            call_id.clone(),
            profile,
            memory,
            config.short_buffer_max_turns,
            config.transcript_labels.clone(),
        );
        Arc::new(Self {
            call_id: call_id.clone(),
            config,
            stt,
            llm,
            tts,
            broker,
            out_tx,
            inner: Mutex::new(Inner {
                state: GatewayState::Idle,
                context,
                metrics: CallMetrics::new(call_id),
                utterance: String::new(),
                staging: String::new(),
                utterance_audio_ms: 0,
            }),
            turn_id: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            audio_sent_count: AtomicU64::new(0),
            playing_until: StdMutex::new(Instant::now()),
            degraded: AtomicBool::new(false),
            vad: StdMutex::new(vad),
            turn_task: StdMutex::new(None),
            event_task: StdMutex::new(None),
        })
    }

    /// Enter LISTENING and start consuming recognizer events.
    pub async fn start(self: &Arc<Self>, mut stt_events: mpsc::UnboundedReceiver<SttEvent>) {
        {
            let mut inner = self.inner.lock().await;
            transition(&mut inner, &self.call_id, GatewayState::Listening);
        }
        info!(target: "companion::gateway", call_id = %self.call_id, "gateway started");

        let gateway = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = stt_events.recv().await {
                gateway.on_stt_event(event).await;
            }
        });
        *self.event_task.lock().unwrap() = Some(handle);
    }

    /// Speak the programmatic greeting at call start. Runs under a normal
    /// turn id so the caller can barge in on it like on any other speech.
    pub async fn greet(self: &Arc<Self>) {
        let my_turn_id = self.begin_turn();
        let greeting = {
            let inner = self.inner.lock().await;
            choose_greeting(inner.context.profile.first_name())
        };
        info!(target: "companion::gateway", call_id = %self.call_id, "sending greeting");

        let mut first_sentence = true;
        self.speak_sentence(my_turn_id, &greeting, &mut first_sentence)
            .await;

        let mut inner = self.inner.lock().await;
        if self.turn_live(my_turn_id) {
            inner.context.append_turn(Role::Agent, &greeting);
            transition(&mut inner, &self.call_id, GatewayState::Listening);
        }
        inner.metrics.start_turn();
    }

    /// Inbound caller frame: decode, run the energy VAD, gate barge-in,
    /// forward PCM to the recognizer regardless of state.
    pub async fn receive_frame(&self, payload_b64: &str) {
        if self.degraded.load(Ordering::SeqCst) {
            return;
        }
        let ulaw = match audio::decode_payload(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "dropping malformed media frame");
                return;
            }
        };
        if ulaw.is_empty() {
            return;
        }
        let samples = audio::ulaw_to_samples(&ulaw);

        let speech_present = self.vad.lock().unwrap().push_frame(&samples);
        if speech_present && self.barge_in_permitted().await {
            self.handle_barge_in().await;
        }

        let pcm = audio::ulaw_to_pcm(&ulaw);
        if let Err(e) = self.stt.send_audio(&pcm).await {
            warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "recognizer send failed, session degraded");
            self.degraded.store(true, Ordering::SeqCst);
        }
    }

    async fn on_stt_event(self: &Arc<Self>, event: SttEvent) {
        match event {
            SttEvent::Disconnected => {
                warn!(target: "companion::gateway", call_id = %self.call_id, "recognizer disconnected, session degraded");
                self.degraded.store(true, Ordering::SeqCst);
            }
            SttEvent::SpeechStarted => {
                if self.barge_in_permitted().await {
                    self.handle_barge_in().await;
                }
            }
            SttEvent::Transcript(t) => self.on_transcript(t).await,
        }
    }

    async fn on_transcript(self: &Arc<Self>, event: TranscriptEvent) {
        let mut inner = self.inner.lock().await;

        // Backup barge-in path: the recognizer heard words while the agent
        // was speaking. Stage them so the caller does not have to repeat.
        if inner.state == GatewayState::Speaking && !event.text.is_empty() {
            if !inner.staging.is_empty() {
                inner.staging.push(' ');
            }
            inner.staging.push_str(&event.text);
            info!(
                target: "companion::gateway",
                call_id = %self.call_id,
                "transcript during agent speech, triggering barge-in"
            );
            drop(inner);
            self.handle_barge_in().await;
            return;
        }

        if inner.state != GatewayState::Listening {
            return;
        }

        if !event.text.is_empty() {
            if inner.utterance.is_empty() {
                inner.metrics.start_turn();
            }
            if event.is_final {
                let cleaned = strip_overlap(&inner.utterance, &event.text);
                if !cleaned.is_empty() {
                    if !inner.utterance.is_empty() {
                        inner.utterance.push(' ');
                    }
                    inner.utterance.push_str(&cleaned);
                }
                inner.utterance_audio_ms += event.audio_ms;
                debug!(
                    target: "companion::gateway",
                    call_id = %self.call_id,
                    chars = inner.utterance.chars().count(),
                    "utterance accumulated"
                );
            } else {
                inner.metrics.stt_partial();
            }
        }

        if event.speech_final {
            if inner.utterance.is_empty() {
                return;
            }
            // A lone filler means the caller is still thinking; hold the turn.
            let cleaned = inner
                .utterance
                .trim()
                .trim_end_matches(['.', ',', '!', '?'])
                .to_lowercase();
            if self.config.filler_words.contains(&cleaned) {
                debug!(target: "companion::gateway", call_id = %self.call_id, "filler word, waiting for more");
                return;
            }
            if inner.utterance_audio_ms > 0
                && inner.utterance_audio_ms < self.config.min_utterance_ms
            {
                debug!(
                    target: "companion::gateway",
                    call_id = %self.call_id,
                    audio_ms = inner.utterance_audio_ms,
                    "utterance below minimum, waiting for more"
                );
                return;
            }
            inner.metrics.end_user_speech();
            inner.metrics.stt_final();
            drop(inner);
            self.spawn_turn();
        } else if event.is_final && inner.utterance_audio_ms > self.config.max_utterance_ms {
            // Monologue bound: commit without waiting for endpointing.
            inner.metrics.end_user_speech();
            inner.metrics.stt_final();
            drop(inner);
            self.spawn_turn();
        }
    }

    /// Barge-in is allowed while the agent holds the floor (SPEAKING, or the
    /// transport is still draining queued audio) and only after enough
    /// chunks went out to rule out hearing our own echo tail.
    async fn barge_in_permitted(&self) -> bool {
        let speaking = { self.inner.lock().await.state == GatewayState::Speaking };
        if !(speaking || self.is_playing()) {
            return false;
        }
        self.audio_sent_count.load(Ordering::SeqCst) >= self.config.min_audio_before_bargein
    }

    fn is_playing(&self) -> bool {
        Instant::now() < *self.playing_until.lock().unwrap()
    }

    /// The caller took the floor: suppress everything in flight. Does not
    /// start a new turn; the next caller utterance will.
    async fn handle_barge_in(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            // Already handled for this turn.
            return;
        }
        *self.playing_until.lock().unwrap() = Instant::now();

        // Tell the transport to drop queued, unplayed audio.
        if self.out_tx.send(TransportCommand::Clear).await.is_err() {
            self.degraded.store(true, Ordering::SeqCst);
        }

        self.llm.cancel();
        self.tts.cancel();

        let mut inner = self.inner.lock().await;
        inner.metrics.record_barge_in();
        let staged = std::mem::take(&mut inner.staging);
        if !staged.is_empty() {
            debug!(target: "companion::gateway", call_id = %self.call_id, "seeding next utterance from staging buffer");
            if inner.utterance.is_empty() {
                inner.utterance = staged;
            } else {
                inner.utterance = format!("{staged} {}", inner.utterance);
            }
        }
        transition(&mut inner, &self.call_id, GatewayState::Listening);
        inner.metrics.start_turn();
        drop(inner);

        self.vad.lock().unwrap().reset();
        info!(target: "companion::gateway", call_id = %self.call_id, "barge-in handled");
    }

    /// Capture-and-increment the turn id and reset all turn-local state.
    fn begin_turn(&self) -> u64 {
        let my_turn_id = self.turn_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancelled.store(false, Ordering::SeqCst);
        self.audio_sent_count.store(0, Ordering::SeqCst);
        *self.playing_until.lock().unwrap() = Instant::now();
        self.vad.lock().unwrap().reset();
        my_turn_id
    }

    fn turn_live(&self, my_turn_id: u64) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
            && self.turn_id.load(Ordering::SeqCst) == my_turn_id
    }

    fn spawn_turn(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let handle = tokio::spawn(async move {
            gateway.process_turn().await;
        });
        *self.turn_task.lock().unwrap() = Some(handle);
    }

    /// The critical section: one complete agent turn.
    async fn process_turn(self: Arc<Self>) {
        let my_turn_id = self.begin_turn();

        let (user_text, history) = {
            let mut inner = self.inner.lock().await;
            let user_text = std::mem::take(&mut inner.utterance);
            inner.utterance_audio_ms = 0;
            if user_text.trim().is_empty() {
                return;
            }
            // History snapshot excludes the utterance we are answering.
            let history = inner.context.short_buffer.turns();
            inner.context.append_turn(Role::Caller, &user_text);
            transition(&mut inner, &self.call_id, GatewayState::Thinking);
            inner.metrics.llm_start();
            (user_text, history)
        };

        let (sentence_tx, mut sentence_rx) = mpsc::channel::<String>(16);
        let generator = Arc::clone(&self.llm);
        let generate_input = user_text.clone();
        let generate_history = history.clone();
        let generation = tokio::spawn(async move {
            generator
                .generate(&generate_input, &generate_history, sentence_tx)
                .await
        });

        let mut first_sentence = true;
        while let Some(sentence) = sentence_rx.recv().await {
            if !self.turn_live(my_turn_id) {
                break;
            }
            self.speak_sentence(my_turn_id, &sentence, &mut first_sentence)
                .await;
        }
        drop(sentence_rx);

        let outcome = match generation.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "generation failed, no agent audio this turn");
                self.finish_turn(my_turn_id, None).await;
                return;
            }
            Err(e) => {
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "generation task failed");
                self.finish_turn(my_turn_id, None).await;
                return;
            }
        };

        let agent_text = match outcome {
            LlmOutcome::Text(text) => text,
            LlmOutcome::ToolCall(request) => {
                // Keep the caller company across the fetch latency. The
                // holding phrase goes through the same tagged egress, so a
                // barge-in can retract the request mid-phrase.
                let phrase = holding_phrase();
                if self.turn_live(my_turn_id) {
                    self.speak_sentence(my_turn_id, phrase, &mut first_sentence)
                        .await;
                }

                let tool_result = self.broker.execute(&request.name, &request.args).await;
                if !self.turn_live(my_turn_id) {
                    self.finish_turn(my_turn_id, None).await;
                    return;
                }

                let (tool_tx, mut tool_rx) = mpsc::channel::<String>(16);
                let generator = Arc::clone(&self.llm);
                let continue_input = user_text.clone();
                let continue_history = history.clone();
                let continuation = tokio::spawn(async move {
                    generator
                        .continue_with_tool_result(
                            &continue_input,
                            &continue_history,
                            &request,
                            &tool_result,
                            tool_tx,
                        )
                        .await
                });

                while let Some(sentence) = tool_rx.recv().await {
                    if !self.turn_live(my_turn_id) {
                        break;
                    }
                    self.speak_sentence(my_turn_id, &sentence, &mut first_sentence)
                        .await;
                }
                drop(tool_rx);

                match continuation.await {
                    Ok(Ok(text)) if !text.trim().is_empty() => format!("{phrase} {text}"),
                    Ok(Ok(_)) => phrase.to_string(),
                    Ok(Err(e)) => {
                        warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "tool continuation failed");
                        self.finish_turn(my_turn_id, None).await;
                        return;
                    }
                    Err(e) => {
                        warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "tool continuation task failed");
                        self.finish_turn(my_turn_id, None).await;
                        return;
                    }
                }
            }
        };

        self.finish_turn(my_turn_id, Some(agent_text)).await;
    }

    /// Close the turn: record the agent text if the turn survived, discard
    /// it if it was cancelled, and return the floor to the caller.
    async fn finish_turn(&self, my_turn_id: u64, agent_text: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.metrics.llm_complete();
        inner.metrics.tts_complete();

        if self.turn_live(my_turn_id) {
            if let Some(text) = agent_text {
                let text = text.trim();
                if !text.is_empty() {
                    inner
                        .metrics
                        .add_llm_tokens(text.split_whitespace().count() as u64);
                    inner.context.append_turn(Role::Agent, text);
                }
            }
            inner.metrics.end_turn();
            transition(&mut inner, &self.call_id, GatewayState::Listening);
            inner.metrics.start_turn();
        } else {
            // Cancelled: the barge-in handler already reset state and
            // metrics; the agent text is discarded entirely.
            debug!(target: "companion::gateway", call_id = %self.call_id, turn_id = my_turn_id, "discarding cancelled turn output");
        }
    }

    /// Synthesize one sentence and stream its chunks to the transport,
    /// awaiting completion so chunks for the next sentence cannot overtake.
    async fn speak_sentence(&self, my_turn_id: u64, sentence: &str, first_sentence: &mut bool) {
        {
            let mut inner = self.inner.lock().await;
            if *first_sentence {
                inner.metrics.llm_first_token();
                *first_sentence = false;
            }
            transition(&mut inner, &self.call_id, GatewayState::Speaking);
            inner.metrics.tts_start();
            inner
                .metrics
                .add_tts_chars(sentence.chars().count() as u64);
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(32);
        let synthesizer = Arc::clone(&self.tts);
        let text = sentence.to_string();
        let synthesis = tokio::spawn(async move { synthesizer.synthesize(&text, chunk_tx).await });

        while let Some(payload) = chunk_rx.recv().await {
            if let Err(e) = self.send_audio(my_turn_id, payload).await {
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "transport egress gone, session degraded");
                self.degraded.store(true, Ordering::SeqCst);
                break;
            }
        }
        // Closing the receiver unblocks the synthesis task if egress died.
        drop(chunk_rx);

        match synthesis.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // This sentence stays silent; later sentences are still tried.
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "synthesis failed for sentence");
            }
            Err(e) => {
                warn!(target: "companion::gateway", call_id = %self.call_id, error = %e, "synthesis task failed");
            }
        }
    }

    /// Transport-send helper: the defense-in-depth egress check. A chunk
    /// whose tag no longer matches the current turn id is dropped even if
    /// its producer never observed the cancellation flag. A closed egress
    /// channel surfaces as `ChannelClosed`.
    async fn send_audio(&self, my_turn_id: u64, payload: String) -> VoiceResult<()> {
        if self.cancelled.load(Ordering::SeqCst)
            || self.turn_id.load(Ordering::SeqCst) != my_turn_id
        {
            debug!(target: "companion::gateway", call_id = %self.call_id, turn_id = my_turn_id, "dropping stale audio chunk");
            return Ok(());
        }

        // Decoded length of base64 is 3/4 of the text; μ-law at 8kHz is one
        // byte per sample, so bytes/8 is the playback time in ms.
        let ulaw_bytes = payload.len() * 3 / 4;
        let playback = Duration::from_millis(ulaw_bytes as u64 / 8 + PLAYBACK_NETWORK_BUFFER_MS);
        let estimate = Instant::now() + playback;

        self.out_tx
            .send(TransportCommand::Media {
                turn_id: my_turn_id,
                payload,
            })
            .await
            .map_err(|_| VoiceError::ChannelClosed("transport egress closed".into()))?;

        self.audio_sent_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut until = self.playing_until.lock().unwrap();
            if estimate > *until {
                *until = estimate;
            }
        }
        self.inner.lock().await.metrics.tts_first_audio();
        Ok(())
    }

    /// Tear the session down and return the full conversation for post-call
    /// processing. Safe to call while a turn is in flight.
    pub async fn stop(self: &Arc<Self>) -> String {
        info!(target: "companion::gateway", call_id = %self.call_id, "gateway stopping");
        self.cancelled.store(true, Ordering::SeqCst);
        self.llm.cancel();
        self.tts.cancel();

        if let Some(handle) = self.turn_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.event_task.lock().unwrap().take() {
            handle.abort();
        }

        if let Err(e) = self.stt.finish().await {
            debug!(target: "companion::gateway", call_id = %self.call_id, error = %e, "recognizer finish failed");
        }
        self.stt.close().await;

        let mut inner = self.inner.lock().await;
        inner.metrics.end_call();
        transition(&mut inner, &self.call_id, GatewayState::Idle);
        inner.context.full_transcript()
    }

    // Introspection, used by the server wiring and the integration tests.

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub async fn state(&self) -> GatewayState {
        self.inner.lock().await.state
    }

    pub fn current_turn_id(&self) -> u64 {
        self.turn_id.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub async fn short_buffer_len(&self) -> usize {
        self.inner.lock().await.context.short_buffer.len()
    }

    pub async fn full_transcript(&self) -> String {
        self.inner.lock().await.context.full_transcript()
    }

    pub async fn barge_in_count(&self) -> u64 {
        self.inner.lock().await.metrics.barge_in_count
    }
}
