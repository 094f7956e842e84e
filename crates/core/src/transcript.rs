//! Transcript types for recognition output

use serde::{Deserialize, Serialize};

/// Transcript result from a recognition provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    /// Transcribed text
    pub text: String,

    /// Is this a final result?
    pub is_final: bool,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    /// Start time offset (ms from stream start)
    pub start_time_ms: u64,

    /// End time offset (ms from stream start)
    pub end_time_ms: u64,

    /// Detected language (ISO 639-1 code)
    pub language: Option<String>,
}

impl TranscriptResult {
    /// Create a new transcript result
    pub fn new(text: impl Into<String>, is_final: bool, confidence: f32) -> Self {
        Self {
            text: text.into(),
            is_final,
            confidence,
            start_time_ms: 0,
            end_time_ms: 0,
            language: None,
        }
    }

    /// Create a partial (non-final) transcript
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, false, confidence)
    }

    /// Create a final transcript
    pub fn final_result(text: impl Into<String>, confidence: f32) -> Self {
        Self::new(text, true, confidence)
    }

    /// Set time range
    pub fn with_time_range(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_time_ms = start_ms;
        self.end_time_ms = end_ms;
        self
    }

    /// Set language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.end_time_ms.saturating_sub(self.start_time_ms)
    }

    /// Check if transcript is empty
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

impl Default for TranscriptResult {
    fn default() -> Self {
        Self::new(String::new(), false, 0.0)
    }
}
