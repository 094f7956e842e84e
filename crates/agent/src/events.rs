//! Session events broadcast to observers

use voice_turn_core::{ProviderId, UtteranceId};

use crate::turn::{TurnId, TurnState};

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session started
    Started { session_id: String },
    /// A turn changed state
    StateChanged {
        turn_id: TurnId,
        old: TurnState,
        new: TurnState,
    },
    UtteranceStarted { utterance_id: UtteranceId, at_ms: u64 },
    UtteranceEnded { utterance_id: UtteranceId, at_ms: u64 },
    /// Interim recognition text, display only
    PartialTranscript { text: String },
    FinalTranscript { turn_id: TurnId, text: String },
    /// Response text handed to synthesis
    ResponseChunk { turn_id: TurnId, text: String },
    /// First audio of the turn was enqueued
    AgentSpeaking { turn_id: TurnId, provider: ProviderId },
    /// Caller interrupted the agent
    BargedIn {
        turn_id: TurnId,
        at_ms: u64,
        cleared_frames: usize,
    },
    TurnFinished {
        turn_id: TurnId,
        state: TurnState,
        response: String,
    },
    Error {
        turn_id: Option<TurnId>,
        message: String,
    },
    /// Session ended
    Ended { reason: String },
}
