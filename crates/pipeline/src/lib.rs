//! Audio pipeline for turn orchestration
//!
//! This crate provides the per-session audio stages:
//! - Audio frame bus between the media transport and the pipeline
//! - Energy-based voice activity detection
//! - Turn detection with hangover, end-of-turn timeout and settle window
//! - Streaming transcription with a single transparent retry
//! - Speech synthesis with prioritized providers and circuit breakers

pub mod bus;
pub mod stt;
pub mod tts;
pub mod turn_detection;
pub mod vad;

// Bus exports
pub use bus::{
    AudioFrameBus, AudioSink, InboundReceiver, InboundSender, OutboundReceiver, OutboundSender,
    PipelineEnd, TransportEnd,
};

// Turn detection exports
pub use turn_detection::{SettleGate, TurnDetector, TurnEvent};
pub use vad::{VadDecision, VoiceActivityDetector};

// STT exports
pub use stt::TranscriptionAdapter;

// TTS exports
pub use tts::{
    CircuitState, ProviderHealth, SpokenChunk, SynthesisAdapter, SynthesisEnd, SynthesisOutcome,
};
