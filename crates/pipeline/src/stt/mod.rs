//! Streaming transcription
//!
//! Wraps a [`SpeechRecognizer`] with one recognition stream per utterance.
//! A failed stream is reopened once and every frame of the utterance is
//! resent; a second failure surfaces as [`Error::Transcription`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use voice_turn_config::TranscriptionConfig;
use voice_turn_core::{
    AudioFrame, Error, ProviderError, RecognitionOptions, RecognitionStream, Result,
    SpeechRecognizer, TranscriptResult, UtteranceId,
};

const PARTIALS_CAPACITY: usize = 64;

enum Session {
    Idle,
    Open(OpenSession),
    Ended(UtteranceId),
}

struct OpenSession {
    utterance_id: UtteranceId,
    stream: Option<Box<dyn RecognitionStream>>,
    frames: Vec<AudioFrame>,
    retried: bool,
}

/// Per-session transcription adapter
pub struct TranscriptionAdapter {
    recognizer: Arc<dyn SpeechRecognizer>,
    options: RecognitionOptions,
    timeout: Duration,
    emit_partials: bool,
    partials_tx: broadcast::Sender<TranscriptResult>,
    session: Session,
}

impl TranscriptionAdapter {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, config: &TranscriptionConfig) -> Self {
        let (partials_tx, _) = broadcast::channel(PARTIALS_CAPACITY);
        Self {
            recognizer,
            options: RecognitionOptions {
                language: Some(config.language.clone()).filter(|l| !l.is_empty()),
                keywords: config.keywords.clone(),
            },
            timeout: config.timeout(),
            emit_partials: config.emit_partials,
            partials_tx,
            session: Session::Idle,
        }
    }

    /// Interim transcripts. Never authoritative.
    pub fn partials(&self) -> broadcast::Receiver<TranscriptResult> {
        self.partials_tx.subscribe()
    }

    /// Utterance whose stream is open, if any
    pub fn active_utterance(&self) -> Option<UtteranceId> {
        match &self.session {
            Session::Open(open) => Some(open.utterance_id),
            _ => None,
        }
    }

    /// Open a recognition stream for a new utterance
    pub async fn begin(&mut self, utterance_id: UtteranceId) -> Result<()> {
        if let Session::Open(open) = &self.session {
            return Err(Error::invalid_state(format!(
                "transcription of utterance {} still open",
                open.utterance_id
            )));
        }

        let mut open = OpenSession {
            utterance_id,
            stream: None,
            frames: Vec::new(),
            retried: false,
        };
        match self.open_stream().await {
            Ok(stream) => open.stream = Some(stream),
            Err(e) => {
                tracing::warn!(utterance_id, error = %e, "Recognition stream failed to open");
                self.reconnect(&mut open, e).await?;
            }
        }
        tracing::debug!(utterance_id, "Transcription started");
        self.session = Session::Open(open);
        Ok(())
    }

    /// Forward a frame of the active utterance
    pub async fn push(&mut self, frame: &AudioFrame) -> Result<()> {
        let mut open = match std::mem::replace(&mut self.session, Session::Idle) {
            Session::Open(open) => open,
            other => {
                let err = match &other {
                    Session::Ended(id) => Error::invalid_state(format!(
                        "frame {} pushed after end of utterance {}",
                        frame.sequence(),
                        id
                    )),
                    _ => Error::invalid_state(format!(
                        "frame {} pushed with no open utterance",
                        frame.sequence()
                    )),
                };
                self.session = other;
                return Err(err);
            }
        };

        open.frames.push(frame.clone());
        let result = match open.stream.as_mut() {
            Some(stream) => with_deadline(self.timeout, stream.push_audio(frame)).await,
            None => Err(ProviderError::StreamClosed),
        };

        match result {
            Ok(Some(partial)) => {
                self.publish_partial(partial);
                self.session = Session::Open(open);
                Ok(())
            }
            Ok(None) => {
                self.session = Session::Open(open);
                Ok(())
            }
            Err(e) => {
                let utterance_id = open.utterance_id;
                match self.reconnect(&mut open, e).await {
                    Ok(()) => {
                        self.session = Session::Open(open);
                        Ok(())
                    }
                    Err(err) => {
                        // Nothing more can be done for this utterance
                        self.session = Session::Ended(utterance_id);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Close the stream and return the final transcript
    pub async fn end(&mut self) -> Result<TranscriptResult> {
        let mut open = match std::mem::replace(&mut self.session, Session::Idle) {
            Session::Open(open) => open,
            Session::Ended(id) => {
                self.session = Session::Ended(id);
                return Err(Error::invalid_state(format!(
                    "utterance {} already ended",
                    id
                )));
            }
            Session::Idle => {
                return Err(Error::invalid_state("end() with no open utterance"));
            }
        };
        let utterance_id = open.utterance_id;
        self.session = Session::Ended(utterance_id);

        let first = match open.stream.as_mut() {
            Some(stream) => with_deadline(self.timeout, stream.close()).await,
            None => Err(ProviderError::StreamClosed),
        };
        let transcript = match first {
            Ok(t) => t,
            Err(e) => {
                self.reconnect(&mut open, e).await?;
                let stream = open
                    .stream
                    .as_mut()
                    .ok_or(Error::Transcription {
                        cause: ProviderError::StreamClosed,
                    })?;
                with_deadline(self.timeout, stream.close())
                    .await
                    .map_err(|cause| self.failed(utterance_id, cause))?
            }
        };

        tracing::info!(
            utterance_id,
            chars = transcript.text.len(),
            confidence = transcript.confidence,
            "Final transcript"
        );
        Ok(TranscriptResult {
            is_final: true,
            ..transcript
        })
    }

    /// Abandon the active utterance, cancelling its stream
    pub async fn abort(&mut self) {
        if let Session::Open(mut open) = std::mem::replace(&mut self.session, Session::Idle) {
            if let Some(stream) = open.stream.as_mut() {
                stream.cancel().await;
            }
            tracing::debug!(utterance_id = open.utterance_id, "Transcription aborted");
        }
        self.session = Session::Idle;
    }

    async fn open_stream(&self) -> std::result::Result<Box<dyn RecognitionStream>, ProviderError> {
        with_deadline(self.timeout, self.recognizer.open_stream(&self.options)).await
    }

    /// Spend the utterance's single retry: reopen and resend every frame
    async fn reconnect(&self, open: &mut OpenSession, cause: ProviderError) -> Result<()> {
        if open.retried {
            return Err(self.failed(open.utterance_id, cause));
        }
        open.retried = true;
        metrics::counter!("voice_turn_transcription_retries_total").increment(1);
        tracing::warn!(
            utterance_id = open.utterance_id,
            error = %cause,
            resend = open.frames.len(),
            "Recognition stream failed, reconnecting"
        );

        if let Some(mut old) = open.stream.take() {
            old.cancel().await;
        }
        let mut stream = self
            .open_stream()
            .await
            .map_err(|e| self.failed(open.utterance_id, e))?;
        for frame in &open.frames {
            match with_deadline(self.timeout, stream.push_audio(frame)).await {
                Ok(Some(partial)) => self.publish_partial(partial),
                Ok(None) => {}
                Err(e) => return Err(self.failed(open.utterance_id, e)),
            }
        }
        open.stream = Some(stream);
        Ok(())
    }

    fn failed(&self, utterance_id: UtteranceId, cause: ProviderError) -> Error {
        tracing::error!(utterance_id, error = %cause, "Transcription failed after retry");
        metrics::counter!(
            "voice_turn_provider_failures_total",
            "stage" => "transcription",
            "provider" => "recognizer"
        )
        .increment(1);
        Error::Transcription { cause }
    }

    fn publish_partial(&self, partial: TranscriptResult) {
        if self.emit_partials && !partial.is_final && !partial.is_empty() {
            let _ = self.partials_tx.send(partial);
        }
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> std::result::Result<T, ProviderError>
where
    F: Future<Output = std::result::Result<T, ProviderError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(deadline.as_millis() as u64)),
    }
}
