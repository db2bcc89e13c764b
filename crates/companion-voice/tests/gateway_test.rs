//! End-to-end scenarios for the turn state machine, driven through scripted
//! mock providers. No network, no audio hardware.

use async_trait::async_trait;
use companion_voice::context::{MemoryState, PersonProfile};
use companion_voice::error::{VoiceError, VoiceResult};
use companion_voice::gateway::{GatewayState, RealtimeGateway, TransportCommand};
use companion_voice::llm::{LlmOutcome, TextGenerator, ToolCallRequest};
use companion_voice::stt::{SpeechRecognizer, SttEvent, TranscriptEvent};
use companion_voice::tools::{Tool, ToolBroker, HOLDING_PHRASES};
use companion_voice::tts::SpeechSynthesizer;
use companion_voice::{audio, GatewayConfig};
use companion_voice::context::ConversationTurn;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Mock providers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockRecognizer {
    frames: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    async fn send_audio(&self, pcm: &[u8]) -> VoiceResult<()> {
        self.frames.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }
    async fn finish(&self) -> VoiceResult<()> {
        Ok(())
    }
    async fn close(&self) {}
}

/// One scripted `generate` call.
struct GenScript {
    sentences: Vec<&'static str>,
    /// Delay before each sentence, to simulate token streaming.
    sentence_delay_ms: u64,
    outcome: Result<LlmOutcome, &'static str>,
}

impl GenScript {
    fn text(sentences: Vec<&'static str>) -> Self {
        let joined = sentences.join(" ");
        Self {
            sentences,
            sentence_delay_ms: 0,
            outcome: Ok(LlmOutcome::Text(joined)),
        }
    }
}

struct MockGenerator {
    scripts: Mutex<VecDeque<GenScript>>,
    continuation_sentences: Mutex<Vec<&'static str>>,
    cancelled: Arc<AtomicBool>,
    generate_inputs: Mutex<Vec<String>>,
    continuation_calls: Mutex<Vec<(ToolCallRequest, String)>>,
}

impl MockGenerator {
    fn new(scripts: Vec<GenScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            continuation_sentences: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            generate_inputs: Mutex::new(Vec::new()),
            continuation_calls: Mutex::new(Vec::new()),
        }
    }

    fn with_continuation(self, sentences: Vec<&'static str>) -> Self {
        *self.continuation_sentences.lock().unwrap() = sentences;
        self
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(
        &self,
        user_text: &str,
        _history: &[ConversationTurn],
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<LlmOutcome> {
        self.cancelled.store(false, Ordering::SeqCst);
        self.generate_inputs.lock().unwrap().push(user_text.to_string());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| GenScript::text(vec!["Ach so."]));

        for sentence in &script.sentences {
            if script.sentence_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(script.sentence_delay_ms)).await;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(LlmOutcome::Text(String::new()));
            }
            if sentence_tx.send((*sentence).to_string()).await.is_err() {
                return Ok(LlmOutcome::Text(String::new()));
            }
        }
        script
            .outcome
            .map_err(|e| VoiceError::Generation(e.to_string()))
    }

    async fn continue_with_tool_result(
        &self,
        _user_text: &str,
        _history: &[ConversationTurn],
        call: &ToolCallRequest,
        tool_result: &str,
        sentence_tx: mpsc::Sender<String>,
    ) -> VoiceResult<String> {
        self.continuation_calls
            .lock()
            .unwrap()
            .push((call.clone(), tool_result.to_string()));
        let sentences = self.continuation_sentences.lock().unwrap().clone();
        for sentence in &sentences {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(String::new());
            }
            let _ = sentence_tx.send((*sentence).to_string()).await;
        }
        Ok(sentences.join(" "))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct MockSynthesizer {
    chunks_per_call: usize,
    chunk_delay_ms: u64,
    /// (call index, chunks to emit before the upstream error).
    fail_on_call: Option<(usize, usize)>,
    cancelled: Arc<AtomicBool>,
    calls: Mutex<Vec<String>>,
    call_counter: AtomicUsize,
}

impl MockSynthesizer {
    fn new(chunks_per_call: usize, chunk_delay_ms: u64) -> Self {
        Self {
            chunks_per_call,
            chunk_delay_ms,
            fail_on_call: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            calls: Mutex::new(Vec::new()),
            call_counter: AtomicUsize::new(0),
        }
    }

    fn failing_on(mut self, call: usize, after_chunks: usize) -> Self {
        self.fail_on_call = Some((call, after_chunks));
        self
    }

    fn payload() -> String {
        audio::encode_payload(&[0xFFu8; 160])
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, chunk_tx: mpsc::Sender<String>) -> VoiceResult<()> {
        self.cancelled.store(false, Ordering::SeqCst);
        let call = self.call_counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(text.to_string());

        for i in 0..self.chunks_per_call {
            if self.chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.chunk_delay_ms)).await;
            }
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some((fail_call, after)) = self.fail_on_call {
                if call == fail_call && i >= after {
                    return Err(VoiceError::Synthesis("upstream 500".into()));
                }
            }
            if chunk_tx.send(Self::payload()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    gateway: Arc<RealtimeGateway>,
    stt_tx: mpsc::UnboundedSender<SttEvent>,
    outbound: Arc<Mutex<Vec<TransportCommand>>>,
    recognizer: Arc<MockRecognizer>,
    generator: Arc<MockGenerator>,
    synthesizer: Arc<MockSynthesizer>,
}

async fn build_harness(
    config: GatewayConfig,
    generator: MockGenerator,
    synthesizer: MockSynthesizer,
) -> Harness {
    let recognizer = Arc::new(MockRecognizer::default());
    let generator = Arc::new(generator);
    let synthesizer = Arc::new(synthesizer);
    let (out_tx, mut out_rx) = mpsc::channel::<TransportCommand>(1024);
    let (stt_tx, stt_rx) = mpsc::unbounded_channel::<SttEvent>();

    let broker = Arc::new(ToolBroker::new(config.tool_timeout_ms, "CA-test"));
    let gateway = RealtimeGateway::new(
        "CA-test",
        config,
        PersonProfile {
            display_name: "Erika Mustermann".into(),
            age: Some(81),
            ..Default::default()
        },
        MemoryState::default(),
        recognizer.clone(),
        generator.clone(),
        synthesizer.clone(),
        broker,
        out_tx,
    );
    gateway.start(stt_rx).await;

    let outbound = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outbound);
    tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            sink.lock().unwrap().push(command);
        }
    });

    Harness {
        gateway,
        stt_tx,
        outbound,
        recognizer,
        generator,
        synthesizer,
    }
}

fn final_utterance(text: &str, audio_ms: u64) -> SttEvent {
    SttEvent::Transcript(TranscriptEvent {
        text: text.to_string(),
        is_final: true,
        speech_final: true,
        confidence: 0.95,
        audio_ms,
    })
}

fn speech_frame(amplitude: i16) -> String {
    let samples = vec![amplitude; 160];
    audio::encode_payload(&audio::samples_to_ulaw(&samples))
}

async fn wait_until<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn media_count(outbound: &Arc<Mutex<Vec<TransportCommand>>>) -> usize {
    outbound
        .lock()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, TransportCommand::Media { .. }))
        .count()
}

async fn wait_for_listening(gateway: &Arc<RealtimeGateway>) {
    for _ in 0..400 {
        if gateway.state().await == GatewayState::Listening {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("gateway never returned to LISTENING");
}

/// The short buffer only grows when a turn actually starts or completes, so
/// its length is the reliable progress signal for the scenarios.
async fn wait_buffer_len(gateway: &Arc<RealtimeGateway>, len: usize) {
    for _ in 0..400 {
        if gateway.short_buffer_len().await == len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("short buffer never reached length {len}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_two_turn_exchange() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![
            GenScript::text(vec!["Mir geht es gut!"]),
            GenScript::text(vec!["Das freut mich."]),
        ]),
        MockSynthesizer::new(3, 0),
    )
    .await;

    assert_eq!(harness.gateway.state().await, GatewayState::Listening);
    assert_eq!(harness.gateway.current_turn_id(), 0);

    harness
        .stt_tx
        .send(final_utterance("Hallo, wie geht es dir?", 1500))
        .unwrap();
    wait_buffer_len(&harness.gateway, 2).await;
    wait_for_listening(&harness.gateway).await;

    wait_until(|| media_count(&harness.outbound) >= 1, "outbound audio").await;
    assert_eq!(harness.gateway.current_turn_id(), 1);

    harness
        .stt_tx
        .send(final_utterance("Mir geht es gut, und dir?", 1800))
        .unwrap();
    wait_buffer_len(&harness.gateway, 4).await;
    wait_for_listening(&harness.gateway).await;
    assert_eq!(harness.gateway.current_turn_id(), 2);

    // I1: the id only ever increased; I3/I5: every egress chunk carries the
    // turn id that was current when it left.
    let outbound = harness.outbound.lock().unwrap();
    let mut last_turn = 0;
    for command in outbound.iter() {
        if let TransportCommand::Media { turn_id, .. } = command {
            assert!(*turn_id >= last_turn, "turn ids must not decrease");
            last_turn = *turn_id;
        }
    }
}

#[tokio::test]
async fn barge_in_mid_sentence_suppresses_stale_audio() {
    let mut config = GatewayConfig::default();
    config.min_audio_before_bargein = 10;

    let harness = build_harness(
        config,
        MockGenerator::new(vec![GenScript {
            sentences: vec!["Das ist ein sehr langer Satz über das Wetter und den Garten."],
            sentence_delay_ms: 0,
            outcome: Ok(LlmOutcome::Text(
                "Das ist ein sehr langer Satz über das Wetter und den Garten.".into(),
            )),
        }]),
        MockSynthesizer::new(200, 5),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Erzähl mir etwas.", 1200))
        .unwrap();
    wait_until(|| media_count(&harness.outbound) >= 15, "agent to be speaking").await;

    // Caller energy: three consecutive voiced frames at RMS ~3000.
    for _ in 0..3 {
        harness.gateway.receive_frame(&speech_frame(3000)).await;
    }

    wait_until(|| harness.gateway.is_cancelled(), "cancellation flag").await;
    assert_eq!(harness.gateway.state().await, GatewayState::Listening);
    assert_eq!(harness.gateway.barge_in_count().await, 1);

    // Caller PCM is forwarded to the recognizer even during agent speech.
    assert_eq!(harness.recognizer.frames.lock().unwrap().len(), 3);

    // Give any straggler synthesis chunks time to hit the egress check.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outbound = harness.outbound.lock().unwrap();
    let clear_at = outbound
        .iter()
        .position(|c| matches!(c, TransportCommand::Clear))
        .expect("a clear frame must be sent");
    let stale_after_clear = outbound[clear_at..]
        .iter()
        .any(|c| matches!(c, TransportCommand::Media { turn_id, .. } if *turn_id == 1));
    assert!(
        !stale_after_clear,
        "no audio tagged with the cancelled turn may follow the clear frame"
    );
}

#[tokio::test]
async fn barge_in_is_suppressed_during_echo_window() {
    let mut config = GatewayConfig::default();
    config.min_audio_before_bargein = 100;

    let harness = build_harness(
        config,
        MockGenerator::new(vec![GenScript::text(vec!["Ein langer Satz."])]),
        MockSynthesizer::new(200, 10),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Hallo?", 1000))
        .unwrap();
    wait_until(|| media_count(&harness.outbound) >= 1, "first agent chunk").await;

    for _ in 0..3 {
        harness.gateway.receive_frame(&speech_frame(3000)).await;
    }

    assert!(
        !harness.gateway.is_cancelled(),
        "barge-in before min_audio_before_bargein chunks must be suppressed"
    );
    assert!(!harness
        .outbound
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, TransportCommand::Clear)));
}

#[tokio::test]
async fn filler_echo_waits_for_the_real_sentence() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![GenScript::text(vec!["Wie schön!"])]),
        MockSynthesizer::new(2, 0),
    )
    .await;

    // "Und." with an endpointing final: still thinking, no turn.
    harness.stt_tx.send(final_utterance("Und.", 300)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.gateway.current_turn_id(), 0);
    assert_eq!(harness.gateway.state().await, GatewayState::Listening);

    // The continuation closes the turn; exactly one turn runs.
    harness
        .stt_tx
        .send(final_utterance("mein Garten ist voll.", 2000))
        .unwrap();
    wait_buffer_len(&harness.gateway, 2).await;
    wait_for_listening(&harness.gateway).await;
    assert_eq!(harness.gateway.current_turn_id(), 1);

    let inputs = harness.generator.generate_inputs.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0], "Und. mein Garten ist voll.");
}

#[tokio::test]
async fn empty_second_final_still_closes_the_turn() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![GenScript::text(vec!["Guten Morgen!"])]),
        MockSynthesizer::new(2, 0),
    )
    .await;

    // A non-filler final without speech_final accumulates only.
    harness
        .stt_tx
        .send(SttEvent::Transcript(TranscriptEvent {
            text: "Guten Morgen".into(),
            is_final: true,
            speech_final: false,
            confidence: 0.9,
            audio_ms: 800,
        }))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.gateway.current_turn_id(), 0);

    // The utterance-end marker arrives with empty text.
    harness.stt_tx.send(final_utterance("", 0)).unwrap();
    wait_buffer_len(&harness.gateway, 2).await;
    wait_for_listening(&harness.gateway).await;
    assert_eq!(harness.gateway.current_turn_id(), 1);

    let inputs = harness.generator.generate_inputs.lock().unwrap();
    assert_eq!(inputs.as_slice(), ["Guten Morgen"]);
}

#[tokio::test]
async fn tool_invocation_speaks_holding_phrase_first() {
    struct FakeNews {
        invocations: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl Tool for FakeNews {
        fn name(&self) -> &str {
            "get_news"
        }
        fn definition(&self) -> serde_json::Value {
            json!({"type": "function", "function": {"name": "get_news"}})
        }
        async fn execute(&self, args: &serde_json::Value) -> VoiceResult<String> {
            self.invocations.lock().unwrap().push(args.clone());
            Ok("1. Eine Meldung.".to_string())
        }
    }

    let invocations = Arc::new(Mutex::new(Vec::new()));
    let config = GatewayConfig::default();

    let generator = Arc::new(
        MockGenerator::new(vec![GenScript {
            sentences: vec![],
            sentence_delay_ms: 0,
            outcome: Ok(LlmOutcome::ToolCall(ToolCallRequest {
                name: "get_news".into(),
                args: json!({"category": "", "count": 3}),
                call_id: "call_1".into(),
            })),
        }])
        .with_continuation(vec!["Hier sind die Nachrichten: eine Meldung."]),
    );
    let synthesizer = Arc::new(MockSynthesizer::new(2, 0));

    let (out_tx, mut out_rx) = mpsc::channel::<TransportCommand>(1024);
    let (stt_tx, stt_rx) = mpsc::unbounded_channel::<SttEvent>();
    let broker = Arc::new(ToolBroker::new(config.tool_timeout_ms, "CA-test").with_tool(
        Box::new(FakeNews {
            invocations: Arc::clone(&invocations),
        }),
    ));
    let gateway = RealtimeGateway::new(
        "CA-test",
        config,
        PersonProfile::default(),
        MemoryState::default(),
        Arc::new(MockRecognizer::default()),
        generator.clone(),
        synthesizer.clone(),
        broker,
        out_tx,
    );
    gateway.start(stt_rx).await;
    tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

    stt_tx
        .send(final_utterance("Gibt es aktuelle Nachrichten?", 2000))
        .unwrap();
    wait_buffer_len(&gateway, 2).await;
    wait_for_listening(&gateway).await;

    // Holding phrase first, then the tool reply.
    {
        let spoken = synthesizer.calls.lock().unwrap();
        assert_eq!(spoken.len(), 2);
        assert!(HOLDING_PHRASES.contains(&spoken[0].as_str()));
        assert_eq!(spoken[1], "Hier sind die Nachrichten: eine Meldung.");
    }

    assert_eq!(invocations.lock().unwrap().len(), 1);
    {
        let continuations = generator.continuation_calls.lock().unwrap();
        assert_eq!(continuations.len(), 1);
        assert_eq!(continuations[0].0.name, "get_news");
        assert_eq!(continuations[0].1, "1. Eine Meldung.");
    }

    // A single turn in the short buffer: one caller, one agent entry.
    assert_eq!(gateway.short_buffer_len().await, 2);
    let transcript = gateway.full_transcript().await;
    assert!(transcript.contains("Hier sind die Nachrichten"));
}

#[tokio::test]
async fn tts_failure_mid_stream_keeps_the_turn_alive() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![GenScript::text(vec![
            "Erster Satz.",
            "Zweiter Satz.",
        ])]),
        MockSynthesizer::new(3, 0).failing_on(0, 1),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Erzähl etwas.", 1200))
        .unwrap();
    wait_buffer_len(&harness.gateway, 2).await;
    wait_for_listening(&harness.gateway).await;

    // First sentence died after one chunk; the second was still attempted.
    {
        let calls = harness.synthesizer.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["Erster Satz.", "Zweiter Satz."]);
    }
    wait_until(
        || media_count(&harness.outbound) >= 1 + 3,
        "one chunk from the failed sentence plus three from the second",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(media_count(&harness.outbound), 1 + 3);

    // The turn completed normally and was recorded.
    assert_eq!(harness.gateway.short_buffer_len().await, 2);
}

#[tokio::test]
async fn hangup_during_thinking_keeps_only_the_caller_turn() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![GenScript {
            sentences: vec!["Diese Antwort kommt zu spät."],
            sentence_delay_ms: 500,
            outcome: Ok(LlmOutcome::Text("Diese Antwort kommt zu spät.".into())),
        }]),
        MockSynthesizer::new(3, 0),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Bist du noch da?", 900))
        .unwrap();
    // The caller turn is in the buffer and the generator is still working.
    wait_buffer_len(&harness.gateway, 1).await;

    // Transport stop arrives while the generator is still working.
    let transcript = harness.gateway.stop().await;

    assert_eq!(transcript, "Anrufer: Bist du noch da?");
    assert_eq!(media_count(&harness.outbound), 0);
    assert_eq!(harness.gateway.state().await, GatewayState::Idle);
}

#[tokio::test]
async fn cancelled_turn_text_never_reaches_the_buffer() {
    let mut config = GatewayConfig::default();
    config.min_audio_before_bargein = 5;

    let harness = build_harness(
        config,
        MockGenerator::new(vec![
            GenScript {
                sentences: vec!["Ich rede und rede und rede."],
                sentence_delay_ms: 0,
                outcome: Ok(LlmOutcome::Text("Ich rede und rede und rede.".into())),
            },
            GenScript::text(vec!["Ja, bitte?"]),
        ]),
        MockSynthesizer::new(200, 5),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Erzähl mal.", 1000))
        .unwrap();
    wait_until(|| media_count(&harness.outbound) >= 8, "agent speaking").await;

    // Backup barge-in path: the recognizer heard words during agent speech.
    harness
        .stt_tx
        .send(SttEvent::Transcript(TranscriptEvent {
            text: "Moment mal".into(),
            is_final: true,
            speech_final: false,
            confidence: 0.9,
            audio_ms: 400,
        }))
        .unwrap();
    wait_until(|| harness.gateway.is_cancelled(), "barge-in").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // I4: the interrupted agent text was discarded; only the caller turn is
    // in the buffer, seeded staging text waits in the accumulator.
    assert_eq!(harness.gateway.short_buffer_len().await, 1);
    let transcript = harness.gateway.full_transcript().await;
    assert!(!transcript.contains("Ich rede"));

    // The staged words open the next turn once the caller finishes.
    harness
        .stt_tx
        .send(final_utterance("was hast du gesagt?", 1500))
        .unwrap();
    wait_buffer_len(&harness.gateway, 3).await;
    wait_for_listening(&harness.gateway).await;
    assert_eq!(harness.gateway.current_turn_id(), 2);

    let inputs = harness.generator.generate_inputs.lock().unwrap();
    assert_eq!(inputs[1], "Moment mal was hast du gesagt?");
}

#[tokio::test]
async fn greeting_is_spoken_and_recorded() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![]),
        MockSynthesizer::new(2, 0),
    )
    .await;

    harness.gateway.greet().await;

    assert_eq!(harness.gateway.state().await, GatewayState::Listening);
    wait_until(|| media_count(&harness.outbound) >= 1, "greeting audio").await;
    assert_eq!(harness.gateway.short_buffer_len().await, 1);
    let transcript = harness.gateway.full_transcript().await;
    assert!(transcript.starts_with("Begleiter:"));
    assert!(transcript.contains("Erika"));
}

#[tokio::test]
async fn speech_started_during_playback_window_triggers_barge_in() {
    let mut config = GatewayConfig::default();
    config.min_audio_before_bargein = 1;

    let harness = build_harness(
        config,
        MockGenerator::new(vec![GenScript::text(vec!["Kurzer Satz."])]),
        MockSynthesizer::new(5, 0),
    )
    .await;

    harness
        .stt_tx
        .send(final_utterance("Hallo!", 900))
        .unwrap();
    wait_buffer_len(&harness.gateway, 2).await;
    wait_for_listening(&harness.gateway).await;

    // Synthesis is done and the state is LISTENING, but the 500ms network
    // buffer means the transport is still playing our audio out loud.
    harness.stt_tx.send(SttEvent::SpeechStarted).unwrap();
    wait_until(|| harness.gateway.is_cancelled(), "barge-in during playback").await;
    wait_until(
        || {
            harness
                .outbound
                .lock()
                .unwrap()
                .iter()
                .any(|c| matches!(c, TransportCommand::Clear))
        },
        "clear frame",
    )
    .await;
}

#[tokio::test]
async fn degraded_recognizer_stops_turn_processing() {
    let harness = build_harness(
        GatewayConfig::default(),
        MockGenerator::new(vec![GenScript::text(vec!["Hallo?"])]),
        MockSynthesizer::new(2, 0),
    )
    .await;

    harness.stt_tx.send(SttEvent::Disconnected).unwrap();
    wait_until(|| harness.gateway.is_degraded(), "degraded flag").await;

    // Frames are dropped silently; stop still returns the (empty) transcript.
    harness.gateway.receive_frame(&speech_frame(3000)).await;
    let transcript = harness.gateway.stop().await;
    assert!(transcript.is_empty());
}
