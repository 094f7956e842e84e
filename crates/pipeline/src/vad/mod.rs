//! Voice Activity Detection
//!
//! Energy-threshold classifier over fixed windows. Frames shorter than a
//! window are buffered until a full window is available; a frame longer
//! than a window yields several decisions.

use voice_turn_core::{audio, AudioFrame};

/// Speech/silence decision for one classification window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    /// Stream time of the window's first sample
    pub start_ms: u64,
    /// Stream time just past the window's last sample
    pub end_ms: u64,
    pub energy_db: f32,
    pub energetic: bool,
    /// Sequence of the frame holding the window's first sample
    pub first_sequence: u64,
    /// Sequence of the frame that completed the window
    pub last_sequence: u64,
}

/// Energy-based voice activity detector
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold_db: f32,
    window_ms: u32,
    sample_rate: u32,
    buffer: Vec<f32>,
    buffer_start_ms: u64,
    buffer_first_sequence: u64,
}

impl VoiceActivityDetector {
    pub fn new(threshold_db: f32, window_ms: u32) -> Self {
        Self {
            threshold_db,
            window_ms: window_ms.max(1),
            sample_rate: 0,
            buffer: Vec::new(),
            buffer_start_ms: 0,
            buffer_first_sequence: 0,
        }
    }

    fn window_samples(&self) -> usize {
        (self.sample_rate as usize * self.window_ms as usize / 1000).max(1)
    }

    /// Classify a frame, returning one decision per completed window
    pub fn classify(&mut self, frame: &AudioFrame) -> Vec<VadDecision> {
        if frame.sample_rate() == 0 || frame.samples().is_empty() {
            return Vec::new();
        }
        if frame.sample_rate() != self.sample_rate {
            if !self.buffer.is_empty() {
                tracing::debug!(
                    from = self.sample_rate,
                    to = frame.sample_rate(),
                    "Sample rate changed, dropping partial window"
                );
            }
            self.sample_rate = frame.sample_rate();
            self.buffer.clear();
        }
        if self.buffer.is_empty() {
            self.buffer_start_ms = frame.timestamp_ms();
            self.buffer_first_sequence = frame.sequence();
        }
        self.buffer.extend_from_slice(frame.samples());

        let window = self.window_samples();
        let mut decisions = Vec::new();
        let mut consumed = 0;
        while self.buffer.len() - consumed >= window {
            let samples = &self.buffer[consumed..consumed + window];
            let energy_db = audio::energy_db(samples);
            let end_ms = self.buffer_start_ms + self.window_ms as u64;
            decisions.push(VadDecision {
                start_ms: self.buffer_start_ms,
                end_ms,
                energy_db,
                energetic: energy_db >= self.threshold_db,
                first_sequence: self.buffer_first_sequence,
                last_sequence: frame.sequence(),
            });
            consumed += window;
            self.buffer_start_ms = end_ms;
            self.buffer_first_sequence = frame.sequence();
        }
        self.buffer.drain(..consumed);
        decisions
    }

    /// Samples waiting for a full window
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_turn_core::StreamDirection;

    fn frame(seq: u64, ts: u64, len: usize, level: f32) -> AudioFrame {
        AudioFrame::new(StreamDirection::Inbound, seq, ts, vec![level; len], 16000)
    }

    #[test]
    fn test_short_frames_are_buffered() {
        let mut vad = VoiceActivityDetector::new(-40.0, 20);

        // 10ms frames; a 20ms window needs two of them
        assert!(vad.classify(&frame(0, 0, 160, 0.3)).is_empty());
        assert_eq!(vad.buffered(), 160);

        let decisions = vad.classify(&frame(1, 10, 160, 0.3));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].start_ms, 0);
        assert_eq!(decisions[0].end_ms, 20);
        assert_eq!(decisions[0].first_sequence, 0);
        assert_eq!(decisions[0].last_sequence, 1);
        assert!(decisions[0].energetic);
        assert_eq!(vad.buffered(), 0);
    }

    #[test]
    fn test_long_frame_yields_multiple_windows() {
        let mut vad = VoiceActivityDetector::new(-40.0, 20);
        let decisions = vad.classify(&frame(0, 100, 800, 0.0));
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[1].start_ms, 120);
        assert!(decisions.iter().all(|d| !d.energetic));
        assert_eq!(vad.buffered(), 160);
    }

    #[test]
    fn test_threshold() {
        let mut vad = VoiceActivityDetector::new(-30.0, 20);
        // 0.01 rms is -40 dBFS
        let quiet = vad.classify(&frame(0, 0, 320, 0.01));
        assert!(!quiet[0].energetic);
        let loud = vad.classify(&frame(1, 20, 320, 0.1));
        assert!(loud[0].energetic);
    }
}
