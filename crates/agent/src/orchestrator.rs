//! Turn orchestration
//!
//! One event loop per session owns the active [`Turn`] and moves it through
//! its states. A detector task segments inbound audio and feeds the loop
//! utterance events followed by the frame that produced them. Each turn's
//! response runs on its own worker task, with generation and synthesis
//! pipelined over a bounded channel; the worker reports progress back to the
//! loop, which is the only writer of turn state.
//!
//! The detector runs ahead of the loop. An utterance whose start precedes,
//! in stream time, the moment its turn began generating was spoken while
//! that turn was still transcribing, so it never barges in.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use voice_turn_config::PipelineConfig;
use voice_turn_core::{
    AudioFrame, Error, ProviderError, ProviderId, Result, TranscriptResult, Utterance, UtteranceId,
};
use voice_turn_llm::{DialogueManager, GenerationStatus};
use voice_turn_pipeline::{
    InboundReceiver, OutboundSender, PipelineEnd, SettleGate, SynthesisAdapter, SynthesisEnd,
    TranscriptionAdapter, TurnDetector, TurnEvent,
};

use crate::events::SessionEvent;
use crate::interruption::{InterruptDecision, InterruptionController, TurnSnapshot};
use crate::turn::{SynthesisStatus, Turn, TurnId, TurnState};

/// Output of the detector task, in inbound order
enum Detected {
    Event(TurnEvent),
    Frame(AudioFrame),
}

/// Worker to loop messages
enum Progress {
    Chunk { turn_id: TurnId, text: String },
    FirstAudio { turn_id: TurnId, provider: ProviderId },
    /// Generation finished and every chunk reached synthesis
    GenerationDone { turn_id: TurnId },
    Finished { turn_id: TurnId, end: TurnEnd },
}

/// How a turn's response ended
enum TurnEnd {
    Completed,
    Cancelled,
    /// Failed before any audio; the caller hears silence
    Silent(Error),
    /// Synthesis broke off mid-response; the apology was spoken
    Truncated(ProviderError),
    /// Session cannot continue
    Fatal(Error),
}

/// Worker messages waiting for the loop
const PROGRESS_CAPACITY: usize = 64;

struct ActiveTurn {
    turn: Turn,
    cancel: CancellationToken,
    settle_until_ms: Option<u64>,
    generating_from_ms: Option<u64>,
}

impl ActiveTurn {
    fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            turn_id: self.turn.id(),
            state: self.turn.state(),
            settle_until_ms: self.settle_until_ms,
            generating_from_ms: self.generating_from_ms,
        }
    }
}

/// Parts consumed when the loop starts
struct Ingest {
    inbound: InboundReceiver,
    detector: TurnDetector,
    progress_rx: mpsc::Receiver<Progress>,
}

/// Per-session turn state machine
pub struct TurnOrchestrator {
    ingest: Option<Ingest>,
    gate: SettleGate,
    /// End of the latest inbound frame seen by the detector
    stream_ms: Arc<AtomicU64>,
    outbound: Arc<OutboundSender>,
    transcription: TranscriptionAdapter,
    dialogue: Arc<Mutex<DialogueManager>>,
    synthesis: Arc<Mutex<SynthesisAdapter>>,
    interruption: InterruptionController,
    events: broadcast::Sender<SessionEvent>,
    progress_tx: mpsc::Sender<Progress>,
    shutdown: CancellationToken,
    settle_window_ms: u64,
    channel_capacity: usize,
    detector_queue: usize,
    next_turn_id: TurnId,
    active: Option<ActiveTurn>,
    /// Utterances that will never become turns; their end is dropped
    ignored: HashSet<UtteranceId>,
}

impl TurnOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        pipeline: PipelineEnd,
        transcription: TranscriptionAdapter,
        dialogue: DialogueManager,
        synthesis: SynthesisAdapter,
        events: broadcast::Sender<SessionEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let detector = TurnDetector::new(&config.turn_detection);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CAPACITY);
        Self {
            gate: detector.settle_gate(),
            ingest: Some(Ingest {
                inbound: pipeline.inbound,
                detector,
                progress_rx,
            }),
            stream_ms: Arc::new(AtomicU64::new(0)),
            outbound: Arc::new(pipeline.outbound),
            transcription,
            dialogue: Arc::new(Mutex::new(dialogue)),
            synthesis: Arc::new(Mutex::new(synthesis)),
            interruption: InterruptionController::new(&config.barge_in),
            events,
            progress_tx,
            shutdown,
            settle_window_ms: config.turn_detection.settle_window_ms,
            channel_capacity: config.dialogue.channel_capacity.max(1),
            detector_queue: config.audio.inbound_queue_frames.max(1),
            next_turn_id: 1,
            active: None,
            ignored: HashSet::new(),
        }
    }

    pub fn dialogue(&self) -> Arc<Mutex<DialogueManager>> {
        Arc::clone(&self.dialogue)
    }

    pub fn synthesis(&self) -> Arc<Mutex<SynthesisAdapter>> {
        Arc::clone(&self.synthesis)
    }

    /// Run until the inbound stream closes, shutdown is requested, or a
    /// fatal error occurs
    pub async fn run(mut self) -> Result<()> {
        let Ingest {
            inbound,
            detector,
            mut progress_rx,
        } = self
            .ingest
            .take()
            .ok_or_else(|| Error::invalid_state("turn orchestrator already running"))?;

        let (detected_tx, mut detected_rx) = mpsc::channel(self.detector_queue);
        let detector_task = tokio::spawn(detect(
            inbound,
            detector,
            detected_tx,
            Arc::clone(&self.stream_ms),
        ));
        let partials_task = tokio::spawn(forward_partials(
            self.transcription.partials(),
            self.events.clone(),
        ));
        tracing::info!("Turn orchestrator started");

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                Some(progress) = progress_rx.recv() => {
                    if let Err(e) = self.on_progress(progress) {
                        break Err(e);
                    }
                }
                detected = detected_rx.recv() => {
                    let step = match detected {
                        Some(Detected::Event(event)) => self.on_turn_event(event).await,
                        Some(Detected::Frame(frame)) => self.on_frame(frame).await,
                        None => break Ok(()),
                    };
                    if let Err(e) = step {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            self.outbound.clear();
            tracing::info!(turn_id = active.turn.id(), state = %active.turn.state(), "Turn abandoned at shutdown");
        }
        self.transcription.abort().await;
        detector_task.abort();
        partials_task.abort();

        match &result {
            Ok(()) => tracing::info!("Turn orchestrator stopped"),
            Err(e) => tracing::error!(error = %e, kind = e.kind(), "Turn orchestrator failed"),
        }
        result
    }

    async fn on_turn_event(&mut self, event: TurnEvent) -> Result<()> {
        match event {
            TurnEvent::UtteranceStarted { utterance_id, at_ms } => {
                self.emit(SessionEvent::UtteranceStarted { utterance_id, at_ms });
                self.on_utterance_started(utterance_id, at_ms).await
            }
            TurnEvent::UtteranceEnded { utterance, at_ms } => {
                self.emit(SessionEvent::UtteranceEnded {
                    utterance_id: utterance.id,
                    at_ms,
                });
                self.on_utterance_ended(utterance).await
            }
        }
    }

    async fn on_utterance_started(&mut self, utterance_id: UtteranceId, at_ms: u64) -> Result<()> {
        if let Some(snapshot) = self.active.as_ref().map(ActiveTurn::snapshot) {
            match self.interruption.on_utterance_started(at_ms, &snapshot) {
                InterruptDecision::BargeIn => {
                    let cleared = match &self.active {
                        Some(active) => {
                            self.interruption
                                .interrupt(snapshot.turn_id, &active.cancel, &self.outbound)
                        }
                        None => 0,
                    };
                    self.emit(SessionEvent::BargedIn {
                        turn_id: snapshot.turn_id,
                        at_ms,
                        cleared_frames: cleared,
                    });
                    self.finish_turn(TurnState::Cancelled)?;
                }
                InterruptDecision::Ignore(reason) => {
                    tracing::debug!(
                        utterance_id,
                        turn_id = snapshot.turn_id,
                        reason = ?reason,
                        "Utterance ignored during active turn"
                    );
                    self.ignored.insert(utterance_id);
                    return Ok(());
                }
            }
        }
        self.start_turn(utterance_id).await
    }

    async fn start_turn(&mut self, utterance_id: UtteranceId) -> Result<()> {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.active = Some(ActiveTurn {
            turn: Turn::new(turn_id, utterance_id),
            cancel: self.shutdown.child_token(),
            settle_until_ms: None,
            generating_from_ms: None,
        });
        self.transition(TurnState::AwaitingUtteranceEnd)?;

        if let Err(e) = self.transcription.begin(utterance_id).await {
            if e.is_fatal() {
                return Err(e);
            }
            self.ignored.insert(utterance_id);
            return self.fail_turn(e);
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: AudioFrame) -> Result<()> {
        let Some(utterance_id) = self
            .active
            .as_ref()
            .filter(|a| a.turn.state() == TurnState::AwaitingUtteranceEnd)
            .map(|a| a.turn.utterance_id())
        else {
            return Ok(());
        };
        if self.transcription.active_utterance() != Some(utterance_id) {
            return Ok(());
        }

        match self.transcription.push(&frame).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.ignored.insert(utterance_id);
                self.fail_turn(e)
            }
        }
    }

    async fn on_utterance_ended(&mut self, utterance: Utterance) -> Result<()> {
        if self.ignored.remove(&utterance.id) {
            tracing::debug!(utterance_id = utterance.id, "Ignored utterance ended");
            return Ok(());
        }
        let Some(active) = self.active.as_mut().filter(|a| {
            a.turn.utterance_id() == utterance.id && a.turn.state() == TurnState::AwaitingUtteranceEnd
        }) else {
            tracing::debug!(utterance_id = utterance.id, "End of untracked utterance");
            return Ok(());
        };
        active.turn.set_utterance(utterance);
        self.transition(TurnState::Transcribing)?;

        let transcript = match self.transcription.end().await {
            Ok(transcript) => transcript,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return self.fail_turn(e),
        };
        let text = transcript.text.trim().to_string();
        if text.is_empty() {
            tracing::info!(turn_id = self.active_id(), "No speech recognised");
            return self.finish_turn(TurnState::Failed);
        }

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if let Some(utterance) = active.turn.utterance_mut() {
            utterance.set_transcript(text.clone())?;
        }
        let turn_id = active.turn.id();
        let cancel = active.cancel.clone();
        self.emit(SessionEvent::FinalTranscript {
            turn_id,
            text: text.clone(),
        });
        self.transition(TurnState::Generating)?;
        let generating_from = self.stream_ms.load(Ordering::Acquire);
        if let Some(active) = self.current_mut(turn_id) {
            active.generating_from_ms = Some(generating_from);
        }
        tracing::debug!(turn_id, generating_from_ms = generating_from, "Response started");

        let worker = TurnWorker {
            turn_id,
            transcript: text,
            dialogue: Arc::clone(&self.dialogue),
            synthesis: Arc::clone(&self.synthesis),
            outbound: Arc::clone(&self.outbound),
            cancel,
            progress: self.progress_tx.clone(),
            channel_capacity: self.channel_capacity,
        };
        tokio::spawn(worker.run());
        Ok(())
    }

    fn on_progress(&mut self, progress: Progress) -> Result<()> {
        match progress {
            Progress::Chunk { turn_id, text } => {
                if let Some(active) = self.current_mut(turn_id) {
                    active.turn.append_response(&text);
                    self.emit(SessionEvent::ResponseChunk { turn_id, text });
                }
                Ok(())
            }
            Progress::FirstAudio { turn_id, provider } => {
                let settle_until = self.stream_ms.load(Ordering::Acquire) + self.settle_window_ms;
                let Some(active) = self.current_mut(turn_id) else {
                    return Ok(());
                };
                active.settle_until_ms = Some(settle_until);
                active.turn.set_active_provider(provider.clone());
                active.turn.set_synthesis_status(SynthesisStatus::Streaming);
                self.gate.suppress_until(settle_until);
                tracing::info!(turn_id, provider = %provider, settle_until_ms = settle_until, "Agent speaking");
                self.emit(SessionEvent::AgentSpeaking { turn_id, provider });
                Ok(())
            }
            Progress::GenerationDone { turn_id } => {
                let generating = self
                    .current_mut(turn_id)
                    .map_or(false, |a| a.turn.state() == TurnState::Generating);
                if generating {
                    self.transition(TurnState::Synthesizing)?;
                }
                Ok(())
            }
            Progress::Finished { turn_id, end } => {
                let current = self.current_mut(turn_id).map(|a| a.turn.state());
                match (end, current) {
                    (TurnEnd::Fatal(e), _) => Err(e),
                    (_, None) => {
                        tracing::debug!(turn_id, "Superseded turn finished");
                        Ok(())
                    }
                    (TurnEnd::Completed, Some(state)) => {
                        if state == TurnState::Generating {
                            self.transition(TurnState::Synthesizing)?;
                        }
                        self.finish_turn(TurnState::Completed)
                    }
                    (TurnEnd::Cancelled, Some(_)) => self.finish_turn(TurnState::Cancelled),
                    (TurnEnd::Silent(e), Some(_)) => self.fail_turn(e),
                    (TurnEnd::Truncated(cause), Some(_)) => {
                        self.emit(SessionEvent::Error {
                            turn_id: Some(turn_id),
                            message: format!("synthesis interrupted: {}", cause),
                        });
                        self.finish_turn(TurnState::Failed)
                    }
                }
            }
        }
    }

    fn current_mut(&mut self, turn_id: TurnId) -> Option<&mut ActiveTurn> {
        self.active.as_mut().filter(|a| a.turn.id() == turn_id)
    }

    fn active_id(&self) -> Option<TurnId> {
        self.active.as_ref().map(|a| a.turn.id())
    }

    fn transition(&mut self, next: TurnState) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Err(Error::invalid_state(format!("no active turn to move to {}", next)));
        };
        let turn_id = active.turn.id();
        let old = active.turn.transition(next)?;
        tracing::debug!(turn_id, utterance_id = active.turn.utterance_id(), from = %old, state = %next, "Turn state changed");
        self.emit(SessionEvent::StateChanged {
            turn_id,
            old,
            new: next,
        });
        Ok(())
    }

    fn fail_turn(&mut self, error: Error) -> Result<()> {
        let turn_id = self.active_id();
        tracing::warn!(turn_id, error = %error, kind = error.kind(), "Turn failed");
        self.emit(SessionEvent::Error {
            turn_id,
            message: error.to_string(),
        });
        self.finish_turn(TurnState::Failed)
    }

    /// Move the active turn to a terminal state, then back to idle
    fn finish_turn(&mut self, state: TurnState) -> Result<()> {
        self.transition(state)?;
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        let status = match state {
            TurnState::Completed => SynthesisStatus::Completed,
            TurnState::Cancelled => SynthesisStatus::Cancelled,
            _ => SynthesisStatus::Failed,
        };
        active.turn.set_synthesis_status(status);

        let turn = &mut active.turn;
        metrics::counter!("voice_turn_turns_total", "status" => state.as_str()).increment(1);
        tracing::info!(
            turn_id = turn.id(),
            utterance_id = turn.utterance_id(),
            state = %state,
            provider = turn.active_provider().map(ProviderId::as_str),
            response_chars = turn.response_text().len(),
            "Turn finished"
        );
        self.emit(SessionEvent::TurnFinished {
            turn_id: turn.id(),
            state,
            response: turn.response_text().to_string(),
        });

        turn.transition(TurnState::Idle)?;
        self.emit(SessionEvent::StateChanged {
            turn_id: turn.id(),
            old: state,
            new: TurnState::Idle,
        });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn detect(
    mut inbound: InboundReceiver,
    mut detector: TurnDetector,
    detected_tx: mpsc::Sender<Detected>,
    stream_ms: Arc<AtomicU64>,
) {
    while let Some(frame) = inbound.recv().await {
        let events = detector.submit(&frame);
        stream_ms.fetch_max(frame.end_ms(), Ordering::AcqRel);
        for event in events {
            if detected_tx.send(Detected::Event(event)).await.is_err() {
                return;
            }
        }
        if detected_tx.send(Detected::Frame(frame)).await.is_err() {
            return;
        }
    }
    tracing::debug!("Inbound stream closed");
}

async fn forward_partials(
    mut partials: broadcast::Receiver<TranscriptResult>,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        match partials.recv().await {
            Ok(partial) => {
                let _ = events.send(SessionEvent::PartialTranscript { text: partial.text });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Partial transcripts dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Runs one turn's response: generation pipelined into synthesis
struct TurnWorker {
    turn_id: TurnId,
    transcript: String,
    dialogue: Arc<Mutex<DialogueManager>>,
    synthesis: Arc<Mutex<SynthesisAdapter>>,
    outbound: Arc<OutboundSender>,
    cancel: CancellationToken,
    progress: mpsc::Sender<Progress>,
    channel_capacity: usize,
}

impl TurnWorker {
    async fn run(self) {
        let end = self.respond().await;
        let _ = self
            .progress
            .send(Progress::Finished {
                turn_id: self.turn_id,
                end,
            })
            .await;
    }

    async fn respond(&self) -> TurnEnd {
        let turn_id = self.turn_id;
        // Held for the whole turn so a superseded worker finishes with the
        // context before the next one starts
        let mut dialogue = self.dialogue.lock().await;
        let mut synthesis = self.synthesis.lock().await;

        let (text_tx, mut text_rx) = mpsc::channel::<String>(self.channel_capacity);
        let (speak_tx, speak_rx) = mpsc::channel::<String>(self.channel_capacity);
        let generation_cancel = self.cancel.child_token();

        let relay_progress = self.progress.clone();
        let relay = async move {
            while let Some(chunk) = text_rx.recv().await {
                let _ = relay_progress
                    .send(Progress::Chunk {
                        turn_id,
                        text: chunk.clone(),
                    })
                    .await;
                if speak_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        };
        let produce = async {
            let (generated, ()) = tokio::join!(
                dialogue.generate(&self.transcript, text_tx, &generation_cancel),
                relay
            );
            if generated.is_ok() {
                let _ = self.progress.send(Progress::GenerationDone { turn_id }).await;
            }
            generated
        };

        let (first_audio_tx, first_audio_rx) = oneshot::channel::<ProviderId>();
        let speak = async {
            let result = synthesis
                .synthesize(turn_id, speak_rx, &self.outbound, &self.cancel, move |provider| {
                    let _ = first_audio_tx.send(provider.clone());
                })
                .await;
            // Stop generating if synthesis gave up
            generation_cancel.cancel();
            result
        };
        // Resolves with an error once synthesis returns without audio
        let announce = async {
            if let Ok(provider) = first_audio_rx.await {
                let _ = self
                    .progress
                    .send(Progress::FirstAudio { turn_id, provider })
                    .await;
            }
        };

        let (generated, synthesized, ()) = tokio::join!(produce, speak, announce);

        if let Ok(outcome) = &generated {
            match &outcome.status {
                GenerationStatus::Partial(cause) => {
                    tracing::warn!(turn_id, error = %cause, chunks = outcome.chunks, "Response truncated by model failure");
                }
                GenerationStatus::Fallback => {
                    tracing::info!(turn_id, "Fallback reply used");
                }
                _ => {}
            }
        }

        let (end, spoken) = match synthesized {
            Err(e) if e.is_fatal() => (TurnEnd::Fatal(e), None),
            Err(e) => (TurnEnd::Silent(e), None),
            Ok(outcome) => {
                let spoke = outcome.frames > 0;
                let record = outcome.clone();
                let end = match outcome.end {
                    _ if self.cancel.is_cancelled() => TurnEnd::Cancelled,
                    SynthesisEnd::Cancelled => TurnEnd::Cancelled,
                    SynthesisEnd::FailedAfterAudio(cause) => {
                        match synthesis
                            .speak_apology(&self.outbound, &self.cancel, outcome.provider.as_ref())
                            .await
                        {
                            Ok(_) => match self.drain().await {
                                TurnEnd::Completed => TurnEnd::Truncated(cause),
                                other => other,
                            },
                            Err(e) => TurnEnd::Fatal(e),
                        }
                    }
                    SynthesisEnd::Completed => match &generated {
                        Err(e) if e.is_fatal() => TurnEnd::Fatal(e.clone()),
                        Err(e) if !spoke => TurnEnd::Silent(e.clone()),
                        _ => self.drain().await,
                    },
                };
                (end, spoke.then_some(record))
            }
        };

        match (&end, &generated, spoken) {
            (TurnEnd::Fatal(_), _, _) => dialogue.discard_exchange(),
            (TurnEnd::Completed, Ok(outcome), Some(_)) => dialogue.commit_exchange(&outcome.text),
            (_, Ok(_), Some(synthesized)) => {
                // Audio still queued at cancellation was cleared, never heard
                let heard = match &end {
                    TurnEnd::Cancelled => self
                        .outbound
                        .handed_off()
                        .map(|sequence| synthesized.text_through(sequence))
                        .unwrap_or_default(),
                    _ => synthesized.spoken_text(),
                };
                if heard.is_empty() {
                    dialogue.discard_exchange();
                } else {
                    tracing::debug!(turn_id, chars = heard.len(), "Committing the spoken part of the response");
                    dialogue.commit_exchange(&heard);
                }
            }
            _ => dialogue.discard_exchange(),
        }
        end
    }

    /// Wait for the turn's audio to reach the transport
    async fn drain(&self) -> TurnEnd {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => TurnEnd::Cancelled,
            drained = self.outbound.wait_drained() => match drained {
                Ok(()) => TurnEnd::Completed,
                Err(e) => TurnEnd::Fatal(e),
            },
        }
    }
}
