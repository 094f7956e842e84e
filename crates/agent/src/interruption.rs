//! Barge-in arbitration
//!
//! Decides whether a caller utterance that starts while a turn is active
//! cancels that turn, and carries out the cancellation.

use tokio_util::sync::CancellationToken;
use voice_turn_config::BargeInConfig;
use voice_turn_pipeline::OutboundSender;

use crate::turn::{TurnId, TurnState};

/// What the controller needs to know about the active turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSnapshot {
    pub turn_id: TurnId,
    pub state: TurnState,
    /// End of the echo settle window, in inbound stream time. `None` until
    /// the turn has produced audio.
    pub settle_until_ms: Option<u64>,
    /// Stream time at which the turn began generating
    pub generating_from_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Disabled,
    NotInterruptible(TurnState),
    Settling { until_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptDecision {
    /// Cancel the active turn and start a new one for this utterance
    BargeIn,
    /// Leave the active turn alone and drop this utterance
    Ignore(IgnoreReason),
}

#[derive(Debug)]
pub struct InterruptionController {
    enabled: bool,
    barge_ins: u64,
}

impl InterruptionController {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            enabled: config.enabled,
            barge_ins: 0,
        }
    }

    pub fn on_utterance_started(&self, at_ms: u64, turn: &TurnSnapshot) -> InterruptDecision {
        if !self.enabled {
            return InterruptDecision::Ignore(IgnoreReason::Disabled);
        }
        if !turn.state.is_interruptible() {
            return InterruptDecision::Ignore(IgnoreReason::NotInterruptible(turn.state));
        }
        // Started before the response did: the turn was still transcribing
        if turn.generating_from_ms.map_or(false, |from| at_ms < from) {
            return InterruptDecision::Ignore(IgnoreReason::NotInterruptible(
                TurnState::Transcribing,
            ));
        }
        match turn.settle_until_ms {
            Some(until_ms) if at_ms < until_ms => {
                InterruptDecision::Ignore(IgnoreReason::Settling { until_ms })
            }
            _ => InterruptDecision::BargeIn,
        }
    }

    /// Cancel the turn's generation and synthesis and drop its queued audio.
    /// Returns the number of frames cleared.
    pub fn interrupt(
        &mut self,
        turn_id: TurnId,
        cancel: &CancellationToken,
        outbound: &OutboundSender,
    ) -> usize {
        cancel.cancel();
        let cleared = outbound.clear();
        self.barge_ins += 1;
        metrics::counter!("voice_turn_barge_in_total").increment(1);
        tracing::info!(turn_id, cleared_frames = cleared, "Barge-in, turn cancelled");
        cleared
    }

    pub fn barge_ins(&self) -> u64 {
        self.barge_ins
    }
}
