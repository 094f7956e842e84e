//! Speech synthesis with provider failover
//!
//! Providers are tried in configured priority order. A turn is pinned to
//! one voice once any of its audio has been emitted: failures before the
//! first frame move the same text to the next provider, failures after it
//! end the turn's synthesis so the caller never hears the voice change
//! mid-sentence.

mod health;

pub use health::{CircuitState, ProviderHealth};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voice_turn_config::SynthesisConfig;
use voice_turn_core::{
    AudioStream, Error, FrameSequencer, ProviderAttempt, ProviderError, ProviderId, Result,
    SpeechSynthesizer, StreamDirection,
};

use crate::bus::OutboundSender;

/// How a turn's synthesis ended, when it did not fail outright
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEnd {
    /// Every chunk was synthesized and enqueued
    Completed,
    /// Cancellation was observed; nothing further was enqueued
    Cancelled,
    /// The pinned provider failed after audio had been emitted
    FailedAfterAudio(ProviderError),
}

/// Result of one turn's synthesis
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    pub end: SynthesisEnd,
    /// Provider that produced this turn's audio
    pub provider: Option<ProviderId>,
    /// Frames enqueued on the outbound bus
    pub frames: u64,
    /// Chunks that produced audio, in the order they were spoken
    pub chunks: Vec<SpokenChunk>,
}

/// A text chunk with at least one frame enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct SpokenChunk {
    pub text: String,
    /// Outbound sequence of the chunk's first frame
    pub first_sequence: u64,
}

impl SynthesisOutcome {
    /// Text of every chunk that produced audio
    pub fn spoken_text(&self) -> String {
        self.text_through(u64::MAX)
    }

    /// Text of the chunks whose first frame is at or before `sequence`
    pub fn text_through(&self, sequence: u64) -> String {
        self.chunks
            .iter()
            .take_while(|c| c.first_sequence <= sequence)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct ProviderSlot {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    health: ProviderHealth,
}

enum ChunkResult {
    Done,
    Cancelled,
    Failed(ProviderError),
}

type PendingRequest =
    Pin<Box<dyn Future<Output = std::result::Result<AudioStream, ProviderError>> + Send>>;

/// Text-to-speech adapter
pub struct SynthesisAdapter {
    providers: Vec<ProviderSlot>,
    sequencer: FrameSequencer,
    playback_ms: u64,
    first_byte_timeout: Duration,
    drain_timeout: Duration,
    apology_phrase: String,
}

impl SynthesisAdapter {
    /// Build the adapter, ordering `providers` by the configured priority list
    pub fn new(
        config: &SynthesisConfig,
        providers: Vec<(ProviderId, Arc<dyn SpeechSynthesizer>)>,
    ) -> Result<Self> {
        let mut available = providers;
        let mut slots = Vec::with_capacity(config.providers.len());
        for id in &config.providers {
            let position = available
                .iter()
                .position(|(pid, _)| pid.as_str() == id)
                .ok_or_else(|| {
                    Error::invalid_state(format!("no synthesizer registered for provider '{}'", id))
                })?;
            let (pid, synthesizer) = available.swap_remove(position);
            slots.push(ProviderSlot {
                synthesizer,
                health: ProviderHealth::new(pid, &config.circuit),
            });
        }
        for (unused, _) in &available {
            tracing::warn!(provider = %unused, "Synthesizer not in priority list, ignoring");
        }
        if slots.is_empty() {
            return Err(Error::invalid_state("no synthesis providers configured"));
        }

        Ok(Self {
            providers: slots,
            sequencer: FrameSequencer::new(StreamDirection::Outbound),
            playback_ms: 0,
            first_byte_timeout: config.first_byte_timeout(),
            drain_timeout: config.drain_timeout(),
            apology_phrase: config.apology_phrase.clone(),
        })
    }

    /// Provider ids in priority order
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.health.id().clone()).collect()
    }

    pub fn health(&self, id: &ProviderId) -> Option<&ProviderHealth> {
        self.providers
            .iter()
            .map(|p| &p.health)
            .find(|h| h.id() == id)
    }

    /// First provider whose circuit admits a call
    pub fn select_provider(&mut self) -> Option<ProviderId> {
        self.next_available(&[]).map(|i| self.providers[i].health.id().clone())
    }

    fn next_available(&mut self, skip: &[usize]) -> Option<usize> {
        (0..self.providers.len())
            .filter(|i| !skip.contains(i))
            .find(|&i| self.providers[i].health.is_available())
    }

    /// Synthesize every chunk received on `text_rx` and enqueue the audio.
    ///
    /// `on_first_audio` runs once, right after the turn's first frame is
    /// enqueued. Returns [`Error::Synthesis`] only if every provider failed
    /// before any audio was emitted.
    pub async fn synthesize<F>(
        &mut self,
        turn_id: u64,
        mut text_rx: mpsc::Receiver<String>,
        outbound: &OutboundSender,
        cancel: &CancellationToken,
        on_first_audio: F,
    ) -> Result<SynthesisOutcome>
    where
        F: FnOnce(&ProviderId) + Send,
    {
        let mut first_audio = Some(on_first_audio);
        let mut emitted = 0u64;
        let mut chunks: Vec<SpokenChunk> = Vec::new();
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut tried: Vec<usize> = Vec::new();

        let Some(mut current) = self.next_available(&[]) else {
            tracing::error!(turn_id, "Every synthesis circuit is open");
            return Err(Error::Synthesis { attempts });
        };
        tracing::debug!(turn_id, provider = %self.providers[current].health.id(), "Synthesis provider selected");

        loop {
            let text = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(self.outcome(SynthesisEnd::Cancelled, current, emitted, chunks));
                }
                text = text_rx.recv() => text,
            };
            let Some(text) = text else { break };
            if text.trim().is_empty() {
                continue;
            }

            loop {
                let before = emitted;
                let mut first_sequence = None;
                let result = self
                    .speak(
                        current,
                        &text,
                        outbound,
                        cancel,
                        &mut emitted,
                        &mut first_sequence,
                        &mut first_audio,
                    )
                    .await?;
                if let Some(first_sequence) = first_sequence {
                    chunks.push(SpokenChunk {
                        text: text.clone(),
                        first_sequence,
                    });
                }
                let provider = self.providers[current].health.id().clone();
                match result {
                    ChunkResult::Done => {
                        self.providers[current].health.record_success();
                        break;
                    }
                    ChunkResult::Cancelled => {
                        tracing::debug!(turn_id, provider = %provider, "Synthesis cancelled");
                        return Ok(self.outcome(SynthesisEnd::Cancelled, current, emitted, chunks));
                    }
                    ChunkResult::Failed(error) => {
                        self.record_failure(current, &error);
                        if emitted > 0 {
                            tracing::warn!(
                                turn_id,
                                provider = %provider,
                                frames = emitted,
                                chunk_frames = emitted - before,
                                error = %error,
                                "Synthesis failed after audio, not switching voice"
                            );
                            return Ok(self.outcome(
                                SynthesisEnd::FailedAfterAudio(error),
                                current,
                                emitted,
                                chunks,
                            ));
                        }

                        attempts.push(ProviderAttempt { provider, error });
                        tried.push(current);
                        match self.next_available(&tried) {
                            Some(next) => {
                                tracing::warn!(
                                    turn_id,
                                    from = %self.providers[current].health.id(),
                                    to = %self.providers[next].health.id(),
                                    "Synthesis failing over before first audio"
                                );
                                current = next;
                            }
                            None => {
                                tracing::error!(turn_id, attempts = attempts.len(), "Synthesis providers exhausted");
                                return Err(Error::Synthesis { attempts });
                            }
                        }
                    }
                }
            }
        }

        Ok(self.outcome(SynthesisEnd::Completed, current, emitted, chunks))
    }

    /// Speak the stock apology, preferring a healthy provider other than
    /// `avoid`. Returns the provider used, or `None` if nothing could speak.
    pub async fn speak_apology(
        &mut self,
        outbound: &OutboundSender,
        cancel: &CancellationToken,
        avoid: Option<&ProviderId>,
    ) -> Result<Option<ProviderId>> {
        let n = self.providers.len();
        let is_avoided = |i: usize, providers: &[ProviderSlot]| Some(providers[i].health.id()) == avoid;
        let mut order: Vec<usize> = (0..n).filter(|&i| !is_avoided(i, &self.providers)).collect();
        order.extend((0..n).filter(|&i| is_avoided(i, &self.providers)));
        let phrase = self.apology_phrase.clone();

        for candidate in order {
            if !self.providers[candidate].health.is_available() {
                continue;
            }
            let mut emitted = 0u64;
            let mut first_sequence = None;
            let mut no_callback: Option<fn(&ProviderId)> = None;
            let provider = self.providers[candidate].health.id().clone();
            match self
                .speak(
                    candidate,
                    &phrase,
                    outbound,
                    cancel,
                    &mut emitted,
                    &mut first_sequence,
                    &mut no_callback,
                )
                .await?
            {
                ChunkResult::Done => {
                    self.providers[candidate].health.record_success();
                    tracing::info!(provider = %provider, frames = emitted, "Apology spoken");
                    return Ok(Some(provider));
                }
                ChunkResult::Cancelled => return Ok(None),
                ChunkResult::Failed(error) => {
                    self.record_failure(candidate, &error);
                    if emitted > 0 {
                        return Ok(Some(provider));
                    }
                }
            }
        }

        tracing::warn!("No healthy provider for apology phrase");
        Ok(None)
    }

    fn record_failure(&mut self, index: usize, error: &ProviderError) {
        let health = &mut self.providers[index].health;
        metrics::counter!(
            "voice_turn_provider_failures_total",
            "stage" => "synthesis",
            "provider" => health.id().to_string()
        )
        .increment(1);
        tracing::warn!(provider = %health.id(), error = %error, "Synthesis call failed");
        health.record_failure();
    }

    fn outcome(
        &self,
        end: SynthesisEnd,
        index: usize,
        frames: u64,
        chunks: Vec<SpokenChunk>,
    ) -> SynthesisOutcome {
        SynthesisOutcome {
            end,
            provider: (frames > 0).then(|| self.providers[index].health.id().clone()),
            frames,
            chunks,
        }
    }

    /// One provider call for one chunk of text
    #[allow(clippy::too_many_arguments)]
    async fn speak<F>(
        &mut self,
        index: usize,
        text: &str,
        outbound: &OutboundSender,
        cancel: &CancellationToken,
        emitted: &mut u64,
        first_sequence: &mut Option<u64>,
        first_audio: &mut Option<F>,
    ) -> Result<ChunkResult>
    where
        F: FnOnce(&ProviderId) + Send,
    {
        let deadline = self.first_byte_timeout;
        let deadline_ms = deadline.as_millis() as u64;
        let synthesizer = Arc::clone(&self.providers[index].synthesizer);
        let owned_text = text.to_string();
        let mut request: PendingRequest =
            Box::pin(async move { synthesizer.synthesize(&owned_text).await });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.drain_request(request);
                return Ok(ChunkResult::Cancelled);
            }
            r = tokio::time::timeout(deadline, &mut request) => r,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Ok(ChunkResult::Failed(e)),
            Err(_) => return Ok(ChunkResult::Failed(ProviderError::Timeout(deadline_ms))),
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.drain_stream(stream);
                    return Ok(ChunkResult::Cancelled);
                }
                item = tokio::time::timeout(deadline, stream.next()) => item,
            };
            let audio = match item {
                Ok(Some(Ok(audio))) => audio,
                Ok(Some(Err(e))) => return Ok(ChunkResult::Failed(e)),
                Ok(None) => return Ok(ChunkResult::Done),
                Err(_) => return Ok(ChunkResult::Failed(ProviderError::Timeout(deadline_ms))),
            };
            if audio.samples.is_empty() {
                continue;
            }

            let duration_ms = audio.duration_ms();
            let frame = self
                .sequencer
                .next_frame(audio.samples, audio.sample_rate, self.playback_ms);
            let sequence = frame.sequence();
            if !outbound.send_cancellable(frame, cancel).await? {
                self.drain_stream(stream);
                return Ok(ChunkResult::Cancelled);
            }
            first_sequence.get_or_insert(sequence);
            self.playback_ms += duration_ms;
            *emitted += 1;
            if *emitted == 1 {
                if let Some(callback) = first_audio.take() {
                    callback(self.providers[index].health.id());
                }
            }
        }
    }

    /// Let a cancelled request finish in the background and discard it
    fn drain_request(&self, request: PendingRequest) {
        let limit = self.drain_timeout;
        tokio::spawn(async move {
            let drained = tokio::time::timeout(limit, async move {
                if let Ok(mut stream) = request.await {
                    while stream.next().await.is_some() {}
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!("Abandoned synthesis request after drain timeout");
            }
        });
    }

    fn drain_stream(&self, mut stream: AudioStream) {
        let limit = self.drain_timeout;
        tokio::spawn(async move {
            let mut discarded = 0usize;
            let drained = tokio::time::timeout(limit, async {
                while stream.next().await.is_some() {
                    discarded += 1;
                }
            })
            .await;
            tracing::debug!(discarded, timed_out = drained.is_err(), "Drained cancelled synthesis stream");
        });
    }
}
