//! Audio frame types
//!
//! Frames are immutable once built. Sequence numbers are assigned per
//! direction by a [`FrameSequencer`] and never reused.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Direction of an audio stream relative to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Caller audio arriving from the media transport
    Inbound,
    /// Synthesized agent audio headed to the media transport
    Outbound,
}

impl StreamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamDirection::Inbound => "inbound",
            StreamDirection::Outbound => "outbound",
        }
    }
}

/// A fixed-duration block of mono PCM samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    direction: StreamDirection,
    sequence: u64,
    timestamp_ms: u64,
    sample_rate: u32,
    samples: Arc<[f32]>,
}

impl AudioFrame {
    /// Create a new frame
    pub fn new(
        direction: StreamDirection,
        sequence: u64,
        timestamp_ms: u64,
        samples: impl Into<Arc<[f32]>>,
        sample_rate: u32,
    ) -> Self {
        Self {
            direction,
            sequence,
            timestamp_ms,
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture (inbound) or playback (outbound) time, ms from stream start
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the sample block, no copy
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    /// Frame duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Timestamp just past the last sample
    pub fn end_ms(&self) -> u64 {
        self.timestamp_ms + self.duration_ms()
    }

    /// Root-mean-square amplitude
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Energy in dBFS (floored at -100 dB for digital silence)
    pub fn energy_db(&self) -> f32 {
        energy_db(&self.samples)
    }
}

/// Root-mean-square amplitude of a sample block
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Energy of a sample block in dBFS
pub fn energy_db(samples: &[f32]) -> f32 {
    let rms = rms(samples);
    if rms <= 1e-5 {
        -100.0
    } else {
        20.0 * rms.log10()
    }
}

/// Assigns strictly increasing sequence numbers for one direction
#[derive(Debug)]
pub struct FrameSequencer {
    direction: StreamDirection,
    next: u64,
}

impl FrameSequencer {
    pub fn new(direction: StreamDirection) -> Self {
        Self { direction, next: 0 }
    }

    /// Build the next frame in this direction
    pub fn next_frame(
        &mut self,
        samples: impl Into<Arc<[f32]>>,
        sample_rate: u32,
        timestamp_ms: u64,
    ) -> AudioFrame {
        let sequence = self.next;
        self.next += 1;
        AudioFrame::new(self.direction, sequence, timestamp_ms, samples, sample_rate)
    }

    /// Number of frames issued so far
    pub fn issued(&self) -> u64 {
        self.next
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }
}
