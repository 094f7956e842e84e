//! Voice session
//!
//! Wires the audio frame bus, the pipeline adapters and the turn
//! orchestrator for one call, and owns the tasks that run them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voice_turn_config::PipelineConfig;
use voice_turn_core::{LanguageModel, ProviderId, SpeechRecognizer, SpeechSynthesizer};
use voice_turn_llm::{DialogueManager, Exchange};
use voice_turn_pipeline::{
    AudioFrameBus, AudioSink, InboundSender, ProviderHealth, SynthesisAdapter, TranscriptionAdapter,
    TransportEnd,
};

use crate::events::{SessionEvent, EVENT_CHANNEL_CAPACITY};
use crate::orchestrator::TurnOrchestrator;
use crate::AgentError;

/// Upper bound on waiting for session tasks at shutdown
const END_TIMEOUT: Duration = Duration::from_secs(3);

/// Provider implementations for one session
#[derive(Clone)]
pub struct SessionProviders {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub model: Arc<dyn LanguageModel>,
    /// Synthesizers by id; ordered by the configured priority list
    pub synthesizers: Vec<(ProviderId, Arc<dyn SpeechSynthesizer>)>,
}

/// Voice session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSessionState {
    /// Built, not yet started
    Created,
    /// Tasks running
    Running,
    /// Session ended
    Ended,
}

struct Unstarted {
    orchestrator: TurnOrchestrator,
    transport: TransportEnd,
}

/// Voice session for a single call
pub struct VoiceSession {
    session_id: String,
    state: RwLock<VoiceSessionState>,
    inbound: InboundSender,
    event_tx: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    dialogue: Arc<tokio::sync::Mutex<DialogueManager>>,
    synthesis: Arc<tokio::sync::Mutex<SynthesisAdapter>>,
    unstarted: Mutex<Option<Unstarted>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceSession {
    /// Create a new voice session
    pub fn new(config: &PipelineConfig, providers: SessionProviders) -> Result<Self, AgentError> {
        config.validate()?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let (transport, pipeline) = AudioFrameBus::new(&config.audio);
        let inbound = transport.inbound();
        let transcription = TranscriptionAdapter::new(providers.recognizer, &config.transcription);
        let dialogue = DialogueManager::new(providers.model, &config.dialogue)
            .with_drain_timeout(config.synthesis.drain_timeout());
        let synthesis = SynthesisAdapter::new(&config.synthesis, providers.synthesizers)?;

        let orchestrator = TurnOrchestrator::new(
            config,
            pipeline,
            transcription,
            dialogue,
            synthesis,
            event_tx.clone(),
            shutdown.child_token(),
        );
        tracing::debug!(session_id = %session_id, "Voice session created");

        Ok(Self {
            session_id,
            state: RwLock::new(VoiceSessionState::Created),
            inbound,
            event_tx,
            shutdown,
            dialogue: orchestrator.dialogue(),
            synthesis: orchestrator.synthesis(),
            unstarted: Mutex::new(Some(Unstarted {
                orchestrator,
                transport,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the orchestrator and outbound delivery to `sink`
    pub async fn start<S>(&self, sink: S) -> Result<(), AgentError>
    where
        S: AudioSink + 'static,
    {
        let Unstarted {
            orchestrator,
            transport,
        } = self.unstarted.lock().take().ok_or(AgentError::AlreadyStarted)?;
        self.set_state(VoiceSessionState::Running);

        let _ = self.event_tx.send(SessionEvent::Started {
            session_id: self.session_id.clone(),
        });

        let events = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let outbound = tokio::spawn(async move {
            match transport.run_outbound(sink).await {
                Ok(delivered) => tracing::debug!(delivered, "Outbound delivery finished"),
                Err(e) => {
                    tracing::error!(error = %e, "Outbound delivery failed, ending session");
                    let _ = events.send(SessionEvent::Error {
                        turn_id: None,
                        message: e.to_string(),
                    });
                    shutdown.cancel();
                }
            }
        });

        let events = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let turns = tokio::spawn(async move {
            if let Err(e) = orchestrator.run().await {
                let _ = events.send(SessionEvent::Error {
                    turn_id: None,
                    message: e.to_string(),
                });
                shutdown.cancel();
            }
        });

        self.tasks.lock().extend([outbound, turns]);
        tracing::info!(session_id = %self.session_id, "Voice session started");
        Ok(())
    }

    /// Handle for the transport's inbound frame callback
    pub fn inbound(&self) -> InboundSender {
        self.inbound.clone()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// End the voice session
    pub async fn end(&self, reason: impl Into<String>) {
        if self.state() == VoiceSessionState::Ended {
            return;
        }
        self.shutdown.cancel();
        self.unstarted.lock().take();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(END_TIMEOUT, task).await.is_err() {
                tracing::warn!(session_id = %self.session_id, "Session task did not stop in time");
            }
        }

        let reason = reason.into();
        self.set_state(VoiceSessionState::Ended);
        tracing::info!(session_id = %self.session_id, reason = %reason, "Voice session ended");
        let _ = self.event_tx.send(SessionEvent::Ended { reason });
    }

    /// Whether the session was shut down, by `end()` or a fatal error
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get current state
    pub fn state(&self) -> VoiceSessionState {
        *self.state.read()
    }

    /// Get session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Health of a synthesis provider. Waits for an in-progress turn.
    pub async fn provider_health(&self, id: &ProviderId) -> Option<ProviderHealth> {
        self.synthesis.lock().await.health(id).cloned()
    }

    /// Committed conversation history. Waits for an in-progress turn.
    pub async fn history(&self) -> Vec<Exchange> {
        self.dialogue.lock().await.context().exchanges().cloned().collect()
    }

    fn set_state(&self, new_state: VoiceSessionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            tracing::debug!(session_id = %self.session_id, old = ?old_state, new = ?new_state, "Session state changed");
        }
    }
}
