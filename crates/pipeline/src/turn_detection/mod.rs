//! Turn detection
//!
//! Segments the inbound stream into utterances from voice-activity
//! decisions. All timing uses frame timestamps, never the wall clock.
//!
//! - An utterance starts on the first energetic window after silence.
//! - Speech persists for `hangover_ms` after energy drops, so trailing
//!   phonemes stay inside the utterance's frame range.
//! - The utterance ends once `end_of_turn_ms` of silence has followed the
//!   last energetic window, or when it exceeds `max_utterance_ms`.
//! - While the [`SettleGate`] is closed (agent audio just started) energy
//!   neither opens an utterance nor counts as speech, and no end is emitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use voice_turn_config::TurnDetectionConfig;
use voice_turn_core::{AudioFrame, Utterance, UtteranceId};

use crate::vad::{VadDecision, VoiceActivityDetector};

/// Utterance boundary event
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    UtteranceStarted {
        utterance_id: UtteranceId,
        at_ms: u64,
    },
    UtteranceEnded {
        /// Finalized utterance; `end_ms` is the end of speech including hangover
        utterance: Utterance,
        /// Stream time at which the end was detected
        at_ms: u64,
    },
}

impl TurnEvent {
    pub fn utterance_id(&self) -> UtteranceId {
        match self {
            TurnEvent::UtteranceStarted { utterance_id, .. } => *utterance_id,
            TurnEvent::UtteranceEnded { utterance, .. } => utterance.id,
        }
    }

    pub fn at_ms(&self) -> u64 {
        match self {
            TurnEvent::UtteranceStarted { at_ms, .. } | TurnEvent::UtteranceEnded { at_ms, .. } => {
                *at_ms
            }
        }
    }
}

/// Shared barge-in suppression deadline, in stream milliseconds
#[derive(Debug, Clone, Default)]
pub struct SettleGate {
    until_ms: Arc<AtomicU64>,
}

impl SettleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress detection for windows starting before `until_ms`
    pub fn suppress_until(&self, until_ms: u64) {
        self.until_ms.store(until_ms, Ordering::Release);
    }

    pub fn clear(&self) {
        self.until_ms.store(0, Ordering::Release);
    }

    pub fn is_suppressed(&self, at_ms: u64) -> bool {
        at_ms < self.until_ms.load(Ordering::Acquire)
    }

    /// Current deadline, if one was ever set
    pub fn deadline(&self) -> Option<u64> {
        match self.until_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }
}

struct OpenUtterance {
    utterance: Utterance,
    last_energy_end_ms: u64,
}

/// Inbound stream segmenter
pub struct TurnDetector {
    config: TurnDetectionConfig,
    vad: VoiceActivityDetector,
    gate: SettleGate,
    open: Option<OpenUtterance>,
    next_id: UtteranceId,
}

impl TurnDetector {
    pub fn new(config: &TurnDetectionConfig) -> Self {
        Self {
            config: config.clone(),
            vad: VoiceActivityDetector::new(config.energy_threshold_db, config.window_ms),
            gate: SettleGate::new(),
            open: None,
            next_id: 1,
        }
    }

    /// Handle used by the orchestrator to open the settle window
    pub fn settle_gate(&self) -> SettleGate {
        self.gate.clone()
    }

    /// Whether an utterance is currently open
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Consume one inbound frame
    pub fn submit(&mut self, frame: &AudioFrame) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        for decision in self.vad.classify(frame) {
            if let Some(event) = self.on_decision(&decision) {
                events.push(event);
            }
        }
        events
    }

    fn on_decision(&mut self, d: &VadDecision) -> Option<TurnEvent> {
        let suppressed = self.gate.is_suppressed(d.start_ms);
        let speech = d.energetic && !suppressed;

        let Some(open) = self.open.as_mut() else {
            if !speech {
                return None;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut utterance = Utterance::open(id, d.start_ms, d.first_sequence);
            utterance.extend_to(d.last_sequence);
            tracing::debug!(utterance_id = id, at_ms = d.start_ms, energy_db = d.energy_db, "Utterance started");
            self.open = Some(OpenUtterance {
                utterance,
                last_energy_end_ms: d.end_ms,
            });
            return Some(TurnEvent::UtteranceStarted {
                utterance_id: id,
                at_ms: d.start_ms,
            });
        };

        if speech {
            open.last_energy_end_ms = d.end_ms;
            open.utterance.extend_to(d.last_sequence);
        } else if d.start_ms < open.last_energy_end_ms + self.config.hangover_ms {
            open.utterance.extend_to(d.last_sequence);
        }

        if suppressed {
            return None;
        }

        let silence_ms = d.end_ms.saturating_sub(open.last_energy_end_ms);
        let length_ms = d.end_ms.saturating_sub(open.utterance.start_ms);
        let forced = length_ms >= self.config.max_utterance_ms;
        if silence_ms < self.config.end_of_turn_ms && !forced {
            return None;
        }

        let OpenUtterance {
            mut utterance,
            last_energy_end_ms,
        } = self.open.take()?;
        let (speech_end_ms, last_sequence) = if forced {
            tracing::warn!(
                utterance_id = utterance.id,
                length_ms,
                "Utterance exceeded maximum duration, forcing end"
            );
            (d.end_ms, d.last_sequence)
        } else {
            let end = (last_energy_end_ms + self.config.hangover_ms).min(d.end_ms);
            (end, utterance.frames.last)
        };
        // A freshly taken utterance is always open
        if let Err(e) = utterance.finalize(speech_end_ms, last_sequence) {
            tracing::error!(error = %e, "Failed to finalize utterance");
            return None;
        }
        tracing::debug!(
            utterance_id = utterance.id,
            at_ms = d.end_ms,
            frames = utterance.frames.len(),
            "Utterance ended"
        );
        Some(TurnEvent::UtteranceEnded {
            utterance,
            at_ms: d.end_ms,
        })
    }
}
