//! Provider boundary traits
//!
//! Speech recognition, the language model, and speech synthesis are remote
//! services reached through these narrow streaming contracts. Responses are
//! lazy, finite streams; consumers decide how far to pull them.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::conversation::ChatMessage;
use crate::error::ProviderError;
use crate::transcript::TranscriptResult;

/// Stable identifier of a configured provider (e.g. "primary", "cartesia")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lazy sequence of model text chunks
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Lazy sequence of synthesized audio blocks
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<SynthesizedAudio, ProviderError>> + Send>>;

/// One block of audio emitted by a synthesis provider
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Options for opening a recognition stream
#[derive(Debug, Clone, Default)]
pub struct RecognitionOptions {
    /// Language hint (ISO 639-1)
    pub language: Option<String>,
    /// Domain words to boost
    pub keywords: Vec<String>,
}

/// Streaming speech-recognition provider
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a new recognition stream
    async fn open_stream(
        &self,
        options: &RecognitionOptions,
    ) -> Result<Box<dyn RecognitionStream>, ProviderError>;
}

/// One open recognition session
#[async_trait]
pub trait RecognitionStream: Send + Sync {
    /// Push a frame; may return an interim transcript
    async fn push_audio(&mut self, frame: &AudioFrame)
        -> Result<Option<TranscriptResult>, ProviderError>;

    /// Close the stream and return the final transcript
    async fn close(&mut self) -> Result<TranscriptResult, ProviderError>;

    /// Abandon the stream mid-utterance
    async fn cancel(&mut self) {}
}

/// Streaming language-model provider
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Request a response to `prompt` given prior `context`
    async fn request(
        &self,
        context: &[ChatMessage],
        prompt: &str,
    ) -> Result<TextStream, ProviderError>;
}

/// Text-to-speech provider. One call per attempt.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError>;
}
