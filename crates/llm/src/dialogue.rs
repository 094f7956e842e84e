//! Dialogue generation
//!
//! Drives the language model for one caller transcript and streams the
//! response to synthesis as speakable chunks over a bounded channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use voice_turn_config::DialogueConfig;
use voice_turn_core::{ChatMessage, Error, LanguageModel, ProviderError, Result, TextStream};

use crate::chunker::SentenceChunker;
use crate::context::ConversationContext;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How generation ended
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationStatus {
    /// Model stream finished normally
    Complete,
    /// Model failed after producing output; what was produced stands
    Partial(ProviderError),
    /// Cancelled, or synthesis stopped listening
    Cancelled,
    /// Call budget exhausted; the configured fallback reply was sent
    Fallback,
}

/// Result of one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub status: GenerationStatus,
    /// Text of every chunk handed to synthesis, in order
    pub text: String,
    pub chunks: usize,
}

type PendingRequest =
    Pin<Box<dyn Future<Output = std::result::Result<TextStream, ProviderError>> + Send>>;

enum Step {
    Token(String),
    End,
    Failed(ProviderError),
    Cancelled,
}

/// Owns conversation context and the language-model boundary
pub struct DialogueManager {
    model: Arc<dyn LanguageModel>,
    context: ConversationContext,
    first_token_timeout: Duration,
    drain_timeout: Duration,
    chunk_min_chars: usize,
    max_model_calls: Option<u32>,
    model_calls: u32,
    fallback_reply: String,
}

impl DialogueManager {
    pub fn new(model: Arc<dyn LanguageModel>, config: &DialogueConfig) -> Self {
        Self {
            model,
            context: ConversationContext::from_config(config),
            first_token_timeout: config.first_token_timeout(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            chunk_min_chars: config.chunk_min_chars,
            max_model_calls: config.max_model_calls,
            model_calls: 0,
            fallback_reply: config.fallback_reply.clone(),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn model_calls(&self) -> u32 {
        self.model_calls
    }

    /// Record the response that was actually spoken for the pending exchange
    pub fn commit_exchange(&mut self, response: &str) {
        if self.context.commit(response).is_some() {
            tracing::debug!(history = self.context.len(), "Exchange committed");
        }
    }

    /// Forget the pending exchange; nothing of the response was spoken
    pub fn discard_exchange(&mut self) {
        if self.context.discard().is_some() {
            tracing::debug!("Exchange discarded");
        }
    }

    /// Generate a response to `transcript`, sending chunks to `chunk_tx` in
    /// model emission order.
    ///
    /// The transcript becomes the pending exchange before the model is
    /// called. Fails with [`Error::Dialogue`] only if the model produced no
    /// output at all.
    pub async fn generate(
        &mut self,
        transcript: &str,
        chunk_tx: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        self.context.begin_exchange(transcript);
        let mut outcome = GenerationOutcome {
            status: GenerationStatus::Complete,
            text: String::new(),
            chunks: 0,
        };

        if cancel.is_cancelled() {
            outcome.status = GenerationStatus::Cancelled;
            return Ok(outcome);
        }

        if let Some(max) = self.max_model_calls {
            if self.model_calls >= max {
                tracing::warn!(max_calls = max, "Model call budget exhausted, using fallback reply");
                let reply = self.fallback_reply.clone();
                outcome.status = if send_chunk(&chunk_tx, &reply, cancel).await {
                    outcome.text = reply;
                    outcome.chunks = 1;
                    GenerationStatus::Fallback
                } else {
                    GenerationStatus::Cancelled
                };
                return Ok(outcome);
            }
        }
        self.model_calls += 1;

        let messages = self.context.messages();
        let model = Arc::clone(&self.model);
        let prompt = transcript.to_string();
        let mut request: PendingRequest =
            Box::pin(async move { model.request(&messages, &prompt).await });

        let started = Instant::now();
        let first_token_deadline = started + self.first_token_timeout;
        let timeout_ms = self.first_token_timeout.as_millis() as u64;

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.drain_request(request);
                outcome.status = GenerationStatus::Cancelled;
                return Ok(outcome);
            }
            r = tokio::time::timeout_at(first_token_deadline, &mut request) => r,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(e)) => return Err(self.failed(e)),
            Err(_) => return Err(self.failed(ProviderError::Timeout(timeout_ms))),
        };

        let mut chunker = SentenceChunker::new(self.chunk_min_chars);
        let mut produced = false;

        loop {
            let step = match stream.as_mut() {
                Some(s) => {
                    let deadline = if produced {
                        Instant::now() + self.first_token_timeout
                    } else {
                        first_token_deadline
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Step::Cancelled,
                        item = tokio::time::timeout_at(deadline, s.next()) => match item {
                            Ok(Some(Ok(token))) => Step::Token(token),
                            Ok(Some(Err(e))) => Step::Failed(e),
                            Ok(None) => Step::End,
                            Err(_) => Step::Failed(ProviderError::Timeout(timeout_ms)),
                        },
                    }
                }
                None => Step::End,
            };

            match step {
                Step::Token(token) => {
                    if !token.is_empty() {
                        if !produced {
                            tracing::debug!(
                                first_token_ms = started.elapsed().as_millis() as u64,
                                "First model token"
                            );
                        }
                        produced = true;
                    }
                    for chunk in chunker.push(&token) {
                        if !self.emit(&chunk_tx, chunk, cancel, &mut outcome).await {
                            if let Some(s) = stream.take() {
                                self.drain_stream(s);
                            }
                            chunker.clear();
                            return Ok(outcome);
                        }
                    }
                }
                Step::End => {
                    if let Some(tail) = chunker.flush() {
                        self.emit(&chunk_tx, tail, cancel, &mut outcome).await;
                    }
                    return Ok(outcome);
                }
                Step::Failed(e) => {
                    if !produced {
                        return Err(self.failed(e));
                    }
                    tracing::warn!(
                        error = %e,
                        chunks = outcome.chunks,
                        "Model failed mid-response, keeping partial output"
                    );
                    metrics::counter!(
                        "voice_turn_provider_failures_total",
                        "stage" => "dialogue",
                        "provider" => "language_model"
                    )
                    .increment(1);
                    if let Some(tail) = chunker.flush() {
                        self.emit(&chunk_tx, tail, cancel, &mut outcome).await;
                    }
                    if outcome.status == GenerationStatus::Complete {
                        outcome.status = GenerationStatus::Partial(e);
                    }
                    return Ok(outcome);
                }
                Step::Cancelled => {
                    tracing::debug!(
                        chunks = outcome.chunks,
                        discarded = chunker.buffered().len(),
                        "Generation cancelled"
                    );
                    chunker.clear();
                    if let Some(s) = stream.take() {
                        self.drain_stream(s);
                    }
                    outcome.status = GenerationStatus::Cancelled;
                    return Ok(outcome);
                }
            }
        }
    }

    /// Hand one chunk to synthesis. Returns `false` when generation must stop.
    async fn emit(
        &self,
        chunk_tx: &mpsc::Sender<String>,
        chunk: String,
        cancel: &CancellationToken,
        outcome: &mut GenerationOutcome,
    ) -> bool {
        if !send_chunk(chunk_tx, &chunk, cancel).await {
            outcome.status = GenerationStatus::Cancelled;
            return false;
        }
        if !outcome.text.is_empty() {
            outcome.text.push(' ');
        }
        outcome.text.push_str(&chunk);
        outcome.chunks += 1;
        true
    }

    fn failed(&self, cause: ProviderError) -> Error {
        metrics::counter!(
            "voice_turn_provider_failures_total",
            "stage" => "dialogue",
            "provider" => "language_model"
        )
        .increment(1);
        tracing::error!(error = %cause, "Model produced no output");
        Error::Dialogue { cause }
    }

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
                tracing::debug!("Abandoned model request after drain timeout");
            }
        });
    }

    fn drain_stream(&self, mut stream: TextStream) {
        let limit = self.drain_timeout;
        tokio::spawn(async move {
            let mut discarded = 0usize;
            let drained = tokio::time::timeout(limit, async {
                while stream.next().await.is_some() {
                    discarded += 1;
                }
            })
            .await;
            tracing::debug!(discarded, timed_out = drained.is_err(), "Drained cancelled model stream");
        });
    }

    /// Messages that would accompany the next request
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        self.context.messages()
    }
}

async fn send_chunk(chunk_tx: &mpsc::Sender<String>, chunk: &str, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = chunk_tx.send(chunk.to_string()) => sent.is_ok(),
    }
}
