//! Utterance bookkeeping
//!
//! An utterance references its inbound frames by sequence range; it never
//! owns audio.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type UtteranceId = u64;

/// Inclusive range of inbound frame sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub first: u64,
    pub last: u64,
}

impl FrameRange {
    pub fn single(sequence: u64) -> Self {
        Self {
            first: sequence,
            last: sequence,
        }
    }

    pub fn len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.first && sequence <= self.last
    }
}

/// One caller speech segment
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub frames: FrameRange,
    pub transcript: Option<String>,
}

impl Utterance {
    /// Open a new utterance at its first frame
    pub fn open(id: UtteranceId, start_ms: u64, first_sequence: u64) -> Self {
        Self {
            id,
            start_ms,
            end_ms: None,
            frames: FrameRange::single(first_sequence),
            transcript: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    /// Extend the referenced frame range while open
    pub fn extend_to(&mut self, sequence: u64) {
        if self.is_open() && sequence > self.frames.last {
            self.frames.last = sequence;
        }
    }

    /// Close the utterance. A second call is rejected and changes nothing.
    pub fn finalize(&mut self, end_ms: u64, last_sequence: u64) -> Result<()> {
        if let Some(existing) = self.end_ms {
            return Err(Error::invalid_state(format!(
                "utterance {} already finalized at {}ms",
                self.id, existing
            )));
        }
        self.extend_to(last_sequence);
        self.end_ms = Some(end_ms.max(self.start_ms));
        Ok(())
    }

    /// Attach the final transcript
    pub fn set_transcript(&mut self, text: impl Into<String>) -> Result<()> {
        if self.is_open() {
            return Err(Error::invalid_state(format!(
                "utterance {} has no end yet",
                self.id
            )));
        }
        if self.transcript.is_some() {
            return Err(Error::invalid_state(format!(
                "utterance {} already transcribed",
                self.id
            )));
        }
        self.transcript = Some(text.into());
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_ms.map(|end| end - self.start_ms)
    }
}
