//! Core traits and types for the turn pipeline
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types and per-direction sequencing
//! - Utterance bookkeeping
//! - Transcript and conversation message types
//! - Provider boundary traits (recognition, language model, synthesis)
//! - Error taxonomy

pub mod audio;
pub mod conversation;
pub mod error;
pub mod provider;
pub mod transcript;
pub mod utterance;

pub use audio::{AudioFrame, FrameSequencer, StreamDirection};
pub use conversation::{ChatMessage, Role};
pub use error::{Error, ProviderAttempt, ProviderError, Result};
pub use provider::{
    AudioStream, LanguageModel, ProviderId, RecognitionOptions, RecognitionStream,
    SpeechRecognizer, SpeechSynthesizer, SynthesizedAudio, TextStream,
};
pub use transcript::TranscriptResult;
pub use utterance::{FrameRange, Utterance, UtteranceId};
