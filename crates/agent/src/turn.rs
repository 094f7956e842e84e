//! Turn lifecycle
//!
//! A turn is one caller utterance and the agent's response to it. Its state
//! only moves forward along
//! `Idle → AwaitingUtteranceEnd → Transcribing → Generating → Synthesizing →
//! {Completed | Cancelled | Failed} → Idle`.

use voice_turn_core::{Error, ProviderId, Result, Utterance, UtteranceId};

pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// No open turn
    Idle,
    /// Utterance open, frames flowing to transcription
    AwaitingUtteranceEnd,
    /// Waiting for the final transcript
    Transcribing,
    /// Model streaming into synthesis
    Generating,
    /// Generation finished, outbound audio still draining
    Synthesizing,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::AwaitingUtteranceEnd => "awaiting_utterance_end",
            TurnState::Transcribing => "transcribing",
            TurnState::Generating => "generating",
            TurnState::Synthesizing => "synthesizing",
            TurnState::Completed => "completed",
            TurnState::Cancelled => "cancelled",
            TurnState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Cancelled | TurnState::Failed)
    }

    /// Whether a barge-in may cancel a turn in this state
    pub fn is_interruptible(&self) -> bool {
        matches!(self, TurnState::Generating | TurnState::Synthesizing)
    }

    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, AwaitingUtteranceEnd)
                | (AwaitingUtteranceEnd, Transcribing)
                | (AwaitingUtteranceEnd, Failed)
                | (Transcribing, Generating)
                | (Transcribing, Failed)
                | (Generating, Synthesizing)
                | (Generating, Cancelled)
                | (Generating, Failed)
                | (Synthesizing, Completed)
                | (Synthesizing, Cancelled)
                | (Synthesizing, Failed)
                | (Completed, Idle)
                | (Cancelled, Idle)
                | (Failed, Idle)
        )
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a turn's outbound audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStatus {
    Pending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SynthesisStatus {
    fn rank(&self) -> u8 {
        match self {
            SynthesisStatus::Pending => 0,
            SynthesisStatus::Streaming => 1,
            _ => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// One caller-utterance-to-agent-response cycle, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    utterance_id: UtteranceId,
    utterance: Option<Utterance>,
    state: TurnState,
    response_text: String,
    synthesis_status: SynthesisStatus,
    active_provider: Option<ProviderId>,
}

impl Turn {
    pub fn new(id: TurnId, utterance_id: UtteranceId) -> Self {
        Self {
            id,
            utterance_id,
            utterance: None,
            state: TurnState::Idle,
            response_text: String::new(),
            synthesis_status: SynthesisStatus::Pending,
            active_provider: None,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn utterance_id(&self) -> UtteranceId {
        self.utterance_id
    }

    /// The finalized utterance, once detection has closed it
    pub fn utterance(&self) -> Option<&Utterance> {
        self.utterance.as_ref()
    }

    pub fn set_utterance(&mut self, utterance: Utterance) {
        self.utterance = Some(utterance);
    }

    pub fn utterance_mut(&mut self) -> Option<&mut Utterance> {
        self.utterance.as_mut()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: TurnState) -> Result<TurnState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "turn {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    pub fn append_response(&mut self, chunk: &str) {
        if !self.response_text.is_empty() {
            self.response_text.push(' ');
        }
        self.response_text.push_str(chunk);
    }

    pub fn synthesis_status(&self) -> SynthesisStatus {
        self.synthesis_status
    }

    /// Advance the synthesis status. Never moves backwards and never leaves
    /// a terminal status.
    pub fn set_synthesis_status(&mut self, status: SynthesisStatus) -> bool {
        if self.synthesis_status.is_terminal() || status.rank() < self.synthesis_status.rank() {
            return false;
        }
        self.synthesis_status = status;
        true
    }

    pub fn active_provider(&self) -> Option<&ProviderId> {
        self.active_provider.as_ref()
    }

    pub fn set_active_provider(&mut self, provider: ProviderId) {
        self.active_provider = Some(provider);
    }
}
