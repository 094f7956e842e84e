//! Audio frame bus
//!
//! Two independent bounded queues connect the media transport to the
//! pipeline: inbound caller audio and outbound agent audio. Both are FIFO.
//! The outbound queue can be cleared on barge-in so stale agent audio is
//! never played over the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use voice_turn_config::AudioConfig;
use voice_turn_core::{AudioFrame, Error, Result, StreamDirection};

/// Destination for outbound frames, implemented by the media transport
#[async_trait]
pub trait AudioSink: Send {
    /// Deliver one frame to the remote peer
    async fn send_outbound_frame(&mut self, frame: AudioFrame) -> Result<()>;
}

/// Constructor for the two queue pairs
pub struct AudioFrameBus;

impl AudioFrameBus {
    /// Create the bus, returning the transport-facing and pipeline-facing halves
    pub fn new(config: &AudioConfig) -> (TransportEnd, PipelineEnd) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_frames.max(1));
        let (backlog_tx, _) = watch::channel(Backlog::default());
        let shared = Arc::new(OutboundQueue {
            state: Mutex::new(OutboundState::default()),
            capacity: config.outbound_queue_frames.max(1),
            items: Notify::new(),
            space: Notify::new(),
            backlog: backlog_tx,
        });

        let transport = TransportEnd {
            inbound: InboundSender {
                tx: inbound_tx,
                last_sequence: Arc::new(Mutex::new(None)),
            },
            outbound: OutboundReceiver {
                queue: Arc::clone(&shared),
            },
        };
        let pipeline = PipelineEnd {
            inbound: InboundReceiver { rx: inbound_rx },
            outbound: OutboundSender { queue: shared },
        };
        (transport, pipeline)
    }
}

/// Transport side: pushes caller audio, pulls agent audio
pub struct TransportEnd {
    inbound: InboundSender,
    outbound: OutboundReceiver,
}

impl TransportEnd {
    /// Handle for the transport's inbound frame callback
    pub fn inbound(&self) -> InboundSender {
        self.inbound.clone()
    }

    /// Deliver outbound frames to `sink` until the pipeline side closes.
    /// Returns the number of frames delivered.
    pub async fn run_outbound<S: AudioSink>(self, mut sink: S) -> Result<u64> {
        let TransportEnd { inbound, outbound } = self;
        drop(inbound);

        let mut delivered = 0u64;
        while let Some(frame) = outbound.recv().await {
            let sequence = frame.sequence();
            let result = sink.send_outbound_frame(frame).await;
            outbound.ack();
            if let Err(e) = result {
                tracing::error!(sequence, error = %e, "Outbound frame delivery failed");
                return Err(match e {
                    Error::Transport(_) => e,
                    other => Error::Transport(other.to_string()),
                });
            }
            delivered += 1;
            metrics::counter!("voice_turn_outbound_frames_total").increment(1);
        }
        tracing::debug!(delivered, "Outbound stream closed");
        Ok(delivered)
    }

    pub fn split(self) -> (InboundSender, OutboundReceiver) {
        (self.inbound, self.outbound)
    }
}

/// Pipeline side: reads caller audio, writes agent audio
pub struct PipelineEnd {
    pub inbound: InboundReceiver,
    pub outbound: OutboundSender,
}

/// Inbound writer held by the media transport
#[derive(Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<AudioFrame>,
    last_sequence: Arc<Mutex<Option<u64>>>,
}

impl InboundSender {
    /// Inbound frame callback. Waits while the queue is full.
    pub async fn on_inbound_frame(&self, frame: AudioFrame) -> Result<()> {
        self.check(&frame)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("inbound pipeline closed".to_string()))
    }

    /// Non-blocking variant; a full queue is reported as a transport error
    pub fn try_on_inbound_frame(&self, frame: AudioFrame) -> Result<()> {
        self.check(&frame)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(f) => Error::Transport(format!(
                "inbound queue full, dropped frame {}",
                f.sequence()
            )),
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport("inbound pipeline closed".to_string())
            }
        })
    }

    fn check(&self, frame: &AudioFrame) -> Result<()> {
        if frame.direction() != StreamDirection::Inbound {
            return Err(Error::invalid_state(format!(
                "{} frame {} submitted as inbound",
                frame.direction().as_str(),
                frame.sequence()
            )));
        }
        let mut last = self.last_sequence.lock();
        if let Some(prev) = *last {
            if frame.sequence() <= prev {
                return Err(Error::invalid_state(format!(
                    "inbound sequence {} not after {}",
                    frame.sequence(),
                    prev
                )));
            }
        }
        *last = Some(frame.sequence());
        Ok(())
    }
}

/// Inbound reader consumed by the turn detector
pub struct InboundReceiver {
    rx: mpsc::Receiver<AudioFrame>,
}

impl InboundReceiver {
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Backlog {
    /// Frames queued plus the one being delivered
    pending: usize,
    closed: bool,
}

#[derive(Default)]
struct OutboundState {
    frames: VecDeque<AudioFrame>,
    in_flight: bool,
    last_sequence: Option<u64>,
    /// Sequence of the newest frame handed to the transport
    handed_off: Option<u64>,
    sender_closed: bool,
    receiver_closed: bool,
}

impl OutboundState {
    fn backlog(&self) -> Backlog {
        Backlog {
            pending: self.frames.len() + usize::from(self.in_flight),
            closed: self.receiver_closed,
        }
    }
}

struct OutboundQueue {
    state: Mutex<OutboundState>,
    capacity: usize,
    items: Notify,
    space: Notify,
    backlog: watch::Sender<Backlog>,
}

impl OutboundQueue {
    fn publish(&self, state: &OutboundState) {
        let backlog = state.backlog();
        self.backlog.send_if_modified(|current| {
            if *current != backlog {
                *current = backlog;
                true
            } else {
                false
            }
        });
    }
}

/// Outbound writer used by the synthesis adapter
pub struct OutboundSender {
    queue: Arc<OutboundQueue>,
}

impl OutboundSender {
    /// Enqueue a frame, waiting while the queue is full
    pub async fn send(&self, frame: AudioFrame) -> Result<()> {
        self.push(frame, None).await.map(|_| ())
    }

    /// Enqueue a frame unless `cancel` fires first. The cancellation check
    /// and the push happen under the queue lock, so a frame is never
    /// enqueued after a cancel that preceded [`clear`](Self::clear).
    ///
    /// Returns `false` if the frame was dropped due to cancellation.
    pub async fn send_cancellable(
        &self,
        frame: AudioFrame,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.push(frame, Some(cancel)).await
    }

    async fn push(&self, frame: AudioFrame, cancel: Option<&CancellationToken>) -> Result<bool> {
        if frame.direction() != StreamDirection::Outbound {
            return Err(Error::invalid_state(format!(
                "inbound frame {} submitted as outbound",
                frame.sequence()
            )));
        }

        loop {
            let waiter = {
                let mut state = self.queue.state.lock();
                if state.receiver_closed {
                    return Err(Error::Transport("outbound transport closed".to_string()));
                }
                if cancel.map_or(false, |c| c.is_cancelled()) {
                    return Ok(false);
                }
                if let Some(prev) = state.last_sequence {
                    if frame.sequence() <= prev {
                        return Err(Error::invalid_state(format!(
                            "outbound sequence {} not after {}",
                            frame.sequence(),
                            prev
                        )));
                    }
                }
                if state.frames.len() < self.queue.capacity {
                    state.last_sequence = Some(frame.sequence());
                    state.frames.push_back(frame);
                    self.queue.publish(&state);
                    self.queue.items.notify_one();
                    return Ok(true);
                }
                self.queue.space.notified()
            };

            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = waiter => {}
                    }
                }
                None => waiter.await,
            }
        }
    }

    /// Drop every frame not yet handed to the transport.
    /// Returns the number of frames discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.queue.state.lock();
        let dropped = state.frames.len();
        state.frames.clear();
        self.queue.publish(&state);
        self.queue.space.notify_one();
        if dropped > 0 {
            tracing::debug!(dropped, "Cleared outbound audio");
        }
        dropped
    }

    /// Sequence of the newest frame the transport has taken. Frames at or
    /// before it are playing or played; later ones can still be cleared.
    pub fn handed_off(&self) -> Option<u64> {
        self.queue.state.lock().handed_off
    }

    /// Frames queued or in delivery
    pub fn pending(&self) -> usize {
        self.queue.state.lock().backlog().pending
    }

    /// Wait until every enqueued frame has been delivered to the transport
    pub async fn wait_drained(&self) -> Result<()> {
        let mut rx = self.queue.backlog.subscribe();
        let backlog = rx
            .wait_for(|b| b.pending == 0 || b.closed)
            .await
            .map(|b| *b)
            .map_err(|_| Error::Transport("outbound queue dropped".to_string()))?;
        if backlog.closed && backlog.pending > 0 {
            return Err(Error::Transport("outbound transport closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for OutboundSender {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.sender_closed = true;
        self.queue.items.notify_one();
    }
}

/// Outbound reader driven by the transport
pub struct OutboundReceiver {
    queue: Arc<OutboundQueue>,
}

impl OutboundReceiver {
    /// Next frame in FIFO order; `None` once the pipeline side is gone and
    /// the queue is empty. The frame counts as pending until [`ack`](Self::ack).
    pub async fn recv(&self) -> Option<AudioFrame> {
        loop {
            let waiter = {
                let mut state = self.queue.state.lock();
                state.in_flight = false;
                if let Some(frame) = state.frames.pop_front() {
                    state.in_flight = true;
                    state.handed_off = Some(frame.sequence());
                    self.queue.publish(&state);
                    self.queue.space.notify_one();
                    return Some(frame);
                }
                self.queue.publish(&state);
                if state.sender_closed {
                    return None;
                }
                self.queue.items.notified()
            };
            waiter.await;
        }
    }

    /// Mark the last received frame as delivered
    pub fn ack(&self) {
        let mut state = self.queue.state.lock();
        state.in_flight = false;
        self.queue.publish(&state);
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.receiver_closed = true;
        state.in_flight = false;
        self.queue.publish(&state);
        self.queue.space.notify_one();
    }
}
