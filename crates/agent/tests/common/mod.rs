//! Scripted providers, a recording transport and caller audio for the
//! integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;

use voice_turn_agent::{SessionEvent, SessionProviders, TurnId, TurnState, VoiceSession};
use voice_turn_config::PipelineConfig;
use voice_turn_core::{
    AudioFrame, AudioStream, ChatMessage, FrameSequencer, LanguageModel, ProviderError, ProviderId,
    RecognitionOptions, RecognitionStream, SpeechRecognizer, SpeechSynthesizer, StreamDirection,
    SynthesizedAudio, TextStream, TranscriptResult,
};
use voice_turn_pipeline::{AudioSink, InboundSender};

pub const SAMPLE_RATE: u32 = 16000;
pub const FRAME_MS: u64 = 20;
const SAMPLES_PER_FRAME: usize = 320;
const SPEECH_LEVEL: f32 = 0.3;

pub const REPLY: &str = "Sure, I can help with that.";

// ---------------------------------------------------------------------------
// Recognition

/// Returns queued transcripts in utterance order, "hello" once exhausted
pub struct ScriptedRecognizer {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    failing_opens: Mutex<u32>,
    opens: Mutex<u32>,
    close_delay: Duration,
}

impl ScriptedRecognizer {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Arc::new(Mutex::new(transcripts.iter().map(|t| t.to_string()).collect())),
            failing_opens: Mutex::new(0),
            opens: Mutex::new(0),
            close_delay: Duration::ZERO,
        }
    }

    /// Hold every final transcript for `delay`
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Make the next `n` stream opens fail
    pub fn fail_opens(self, n: u32) -> Self {
        *self.failing_opens.lock() = n;
        self
    }

    pub fn opens(&self) -> u32 {
        *self.opens.lock()
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn open_stream(
        &self,
        _options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionStream>, ProviderError> {
        *self.opens.lock() += 1;
        {
            let mut failing = self.failing_opens.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(ProviderError::Connection("recognizer unreachable".to_string()));
            }
        }
        Ok(Box::new(ScriptedRecognition {
            transcripts: Arc::clone(&self.transcripts),
            frames: 0,
            close_delay: self.close_delay,
        }))
    }
}

struct ScriptedRecognition {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    frames: u32,
    close_delay: Duration,
}

#[async_trait]
impl RecognitionStream for ScriptedRecognition {
    async fn push_audio(
        &mut self,
        _frame: &AudioFrame,
    ) -> Result<Option<TranscriptResult>, ProviderError> {
        self.frames += 1;
        Ok((self.frames % 25 == 0).then(|| TranscriptResult::partial("...", 0.4)))
    }

    async fn close(&mut self) -> Result<TranscriptResult, ProviderError> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        let text = self
            .transcripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| "hello".to_string());
        Ok(TranscriptResult::final_result(text, 0.9))
    }
}

// ---------------------------------------------------------------------------
// Language model

#[derive(Debug, Clone)]
pub enum ModelReply {
    Tokens(Vec<String>),
    Reject,
}

impl ModelReply {
    pub fn text(text: &str) -> Self {
        ModelReply::Tokens(text.split_inclusive(' ').map(str::to_string).collect())
    }
}

/// Replies from a script, [`REPLY`] once exhausted; records every request
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, String)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(Vec<ChatMessage>, String)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn request(
        &self,
        context: &[ChatMessage],
        prompt: &str,
    ) -> Result<TextStream, ProviderError> {
        self.requests.lock().push((context.to_vec(), prompt.to_string()));
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| ModelReply::text(REPLY));
        match reply {
            ModelReply::Reject => Err(ProviderError::Rejected("model overloaded".to_string())),
            ModelReply::Tokens(tokens) => Ok(Box::pin(async_stream::stream! {
                for token in tokens {
                    yield Ok::<_, ProviderError>(token);
                }
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis

/// Script for one synthesize() call
#[derive(Debug, Clone, Copy)]
pub enum SynthCall {
    /// Emit n blocks then finish
    Frames(usize),
    /// Reject the request
    Reject,
    /// Emit n blocks then fail
    FailAfter(usize),
}

/// Emits one frame-sized block per item. Each block carries a distinct
/// constant sample value so delivered frames can be traced back.
pub struct ScriptedSynth {
    script: Mutex<VecDeque<SynthCall>>,
    default_frames: usize,
    base: f32,
    texts: Mutex<Vec<String>>,
    emitted: Arc<Mutex<Vec<f32>>>,
}

impl ScriptedSynth {
    pub fn new(base: f32, default_frames: usize, script: Vec<SynthCall>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_frames,
            base,
            texts: Mutex::new(Vec::new()),
            emitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Texts of every call, including failed ones
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    /// Sample value of every block handed out, in order
    pub fn emitted(&self) -> Vec<f32> {
        self.emitted.lock().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        let call_index = {
            let mut texts = self.texts.lock();
            texts.push(text.to_string());
            texts.len() - 1
        };
        let call = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(SynthCall::Frames(self.default_frames));

        let (frames, fail) = match call {
            SynthCall::Reject => {
                return Err(ProviderError::Rejected("voice unavailable".to_string()))
            }
            SynthCall::Frames(n) => (n, false),
            SynthCall::FailAfter(n) => (n, true),
        };
        let base = self.base + call_index as f32 * 0.01;
        let emitted = Arc::clone(&self.emitted);
        Ok(Box::pin(async_stream::stream! {
            for i in 0..frames {
                let value = base + i as f32 * 0.0001;
                emitted.lock().push(value);
                yield Ok(SynthesizedAudio::new(vec![value; SAMPLES_PER_FRAME], SAMPLE_RATE));
            }
            if fail {
                yield Err(ProviderError::Connection("stream reset".to_string()));
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Transport

/// Records delivered frames, optionally pacing delivery like real playback
#[derive(Clone)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    delay: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
            delay,
        }
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// First sample of each delivered frame
    pub fn values(&self) -> Vec<f32> {
        self.frames.lock().iter().map(|f| f.samples()[0]).collect()
    }

    pub async fn wait_for_frames(&self, n: usize, within: Duration) {
        let waited = timeout(within, async {
            while self.len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "expected {} frames, got {}", n, self.len());
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn send_outbound_frame(&mut self, frame: AudioFrame) -> voice_turn_core::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Caller

/// Pushes 20ms caller frames with a running stream clock
pub struct Caller {
    inbound: InboundSender,
    sequencer: FrameSequencer,
    clock_ms: u64,
}

impl Caller {
    pub fn new(inbound: InboundSender) -> Self {
        Self {
            inbound,
            sequencer: FrameSequencer::new(StreamDirection::Inbound),
            clock_ms: 0,
        }
    }

    pub fn clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub async fn speak(&mut self, ms: u64) {
        self.push(ms, SPEECH_LEVEL).await;
    }

    pub async fn pause(&mut self, ms: u64) {
        self.push(ms, 0.0).await;
    }

    /// Speech followed by enough silence to end the turn
    pub async fn utterance(&mut self, speech_ms: u64) {
        self.speak(speech_ms).await;
        self.pause(800).await;
    }

    async fn push(&mut self, ms: u64, level: f32) {
        for _ in 0..ms / FRAME_MS {
            let frame = self
                .sequencer
                .next_frame(vec![level; SAMPLES_PER_FRAME], SAMPLE_RATE, self.clock_ms);
            self.inbound.on_inbound_frame(frame).await.unwrap();
            self.clock_ms += FRAME_MS;
        }
    }
}

// ---------------------------------------------------------------------------
// Events

/// Collects every session event seen while waiting
pub struct EventLog {
    rx: broadcast::Receiver<SessionEvent>,
    seen: Vec<SessionEvent>,
}

impl EventLog {
    pub fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Wait until an event matching `pred` has been observed
    pub async fn wait_for<F>(&mut self, within: Duration, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        if let Some(event) = self.seen.iter().find(|e| pred(e)) {
            return event.clone();
        }
        let found = timeout(within, async {
            loop {
                match self.rx.recv().await {
                    Ok(event) => {
                        self.seen.push(event.clone());
                        if pred(&event) {
                            return event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => panic!("lagged {} events", n),
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await;
        match found {
            Ok(event) => event,
            Err(_) => panic!("timed out; events so far: {:#?}", self.seen),
        }
    }

    pub async fn turn_finished(&mut self, turn_id: TurnId) -> TurnState {
        let event = self
            .wait_for(Duration::from_secs(5), |e| {
                matches!(e, SessionEvent::TurnFinished { turn_id: id, .. } if *id == turn_id)
            })
            .await;
        match event {
            SessionEvent::TurnFinished { state, .. } => state,
            _ => unreachable!(),
        }
    }

    /// Take everything already queued without waiting
    pub fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
    }

    pub fn seen(&self) -> &[SessionEvent] {
        &self.seen
    }

    pub fn errors(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }

    /// Every turn's observed states form a valid path starting from idle
    pub fn assert_valid_paths(&self) {
        let mut paths: HashMap<TurnId, Vec<(TurnState, TurnState)>> = HashMap::new();
        for event in &self.seen {
            if let SessionEvent::StateChanged { turn_id, old, new } = event {
                paths.entry(*turn_id).or_default().push((*old, *new));
            }
        }
        for (turn_id, path) in paths {
            assert_eq!(path[0].0, TurnState::Idle, "turn {} did not start idle", turn_id);
            for pair in path.windows(2) {
                assert_eq!(pair[0].1, pair[1].0, "turn {} skipped a state: {:?}", turn_id, path);
            }
            for (old, new) in &path {
                assert!(
                    old.can_transition_to(*new),
                    "turn {} invalid transition {} -> {}",
                    turn_id,
                    old,
                    new
                );
            }
        }
    }

    /// Utterance starts and ends alternate, each end closing the last start
    pub fn assert_nested_utterances(&self) {
        let mut open = None;
        for event in &self.seen {
            match event {
                SessionEvent::UtteranceStarted { utterance_id, .. } => {
                    assert_eq!(open, None, "utterance {} started inside another", utterance_id);
                    open = Some(*utterance_id);
                }
                SessionEvent::UtteranceEnded { utterance_id, .. } => {
                    assert_eq!(open, Some(*utterance_id), "unmatched end of {}", utterance_id);
                    open = None;
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session

pub struct Harness {
    pub session: VoiceSession,
    pub caller: Caller,
    pub events: EventLog,
    pub sink: RecordingSink,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub model: Arc<ScriptedModel>,
    pub primary: Arc<ScriptedSynth>,
    pub fallback: Arc<ScriptedSynth>,
}

impl Harness {
    pub fn primary_id() -> ProviderId {
        ProviderId::new("primary")
    }

    pub fn fallback_id() -> ProviderId {
        ProviderId::new("fallback")
    }
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.synthesis.providers = vec!["primary".to_string(), "fallback".to_string()];
    // One chunk per scripted reply
    config.dialogue.chunk_min_chars = 200;
    config
}

pub async fn start_session(
    config: PipelineConfig,
    recognizer: ScriptedRecognizer,
    model: ScriptedModel,
    primary: ScriptedSynth,
    fallback: ScriptedSynth,
    sink: RecordingSink,
) -> Harness {
    let recognizer = Arc::new(recognizer);
    let model = Arc::new(model);
    let primary = Arc::new(primary);
    let fallback = Arc::new(fallback);

    let providers = SessionProviders {
        recognizer: recognizer.clone(),
        model: model.clone(),
        synthesizers: vec![
            (Harness::primary_id(), primary.clone() as Arc<dyn SpeechSynthesizer>),
            (Harness::fallback_id(), fallback.clone() as Arc<dyn SpeechSynthesizer>),
        ],
    };
    let session = VoiceSession::new(&config, providers).unwrap();
    let events = EventLog::new(session.subscribe());
    let caller = Caller::new(session.inbound());
    session.start(sink.clone()).await.unwrap();

    Harness {
        session,
        caller,
        events,
        sink,
        recognizer,
        model,
        primary,
        fallback,
    }
}

/// Session with default scripts: every call succeeds
pub async fn default_session(sink: RecordingSink) -> Harness {
    start_session(
        test_config(),
        ScriptedRecognizer::new(&[]),
        ScriptedModel::new(Vec::new()),
        ScriptedSynth::new(0.1, 5, Vec::new()),
        ScriptedSynth::new(0.5, 5, Vec::new()),
        sink,
    )
    .await
}
