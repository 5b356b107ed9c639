//! Owned handle to one in-flight stream
//!
//! Each stream runs in its own task and delivers `CaptureEvent`s over a
//! bounded channel. The handle is the only way to observe them, so once it
//! is cancelled nothing more is delivered, including events already queued.

use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::CaptureEvent;

use super::decoder::FrameDecoder;
use super::dispatcher::StreamContext;
use super::envelope;

const EVENT_BUFFER: usize = 64;

/// Cloneable cancellation for one operation
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the stream. Returns immediately; the connection is released by
    /// the stream task as soon as it observes the cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Receiving side of one stream
#[derive(Debug)]
pub struct StreamHandle {
    events: mpsc::Receiver<CaptureEvent>,
    cancel: CancelHandle,
}

/// Sending side, held by the stream task
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CaptureEvent>,
    cancel: CancelHandle,
}

impl StreamHandle {
    /// A connected handle/sender pair
    pub fn channel() -> (StreamHandle, EventSender) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancelHandle::new();
        (
            StreamHandle {
                events: rx,
                cancel: cancel.clone(),
            },
            EventSender { tx, cancel },
        )
    }

    /// Spawn a task that decodes `body` and delivers its events
    pub fn spawn_body<S, B, E>(body: S) -> StreamHandle
    where
        S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (handle, sender) = Self::channel();
        tokio::spawn(pump(body, sender));
        handle
    }

    /// A handle that delivers a single terminal event
    pub fn ready(event: CaptureEvent) -> StreamHandle {
        let (handle, sender) = Self::channel();
        // capacity is never exhausted by one event
        let _ = sender.tx.try_send(event);
        handle
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next event, or `None` once the stream is done or cancelled
    pub async fn next_event(&mut self) -> Option<CaptureEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => {
                if self.cancel.is_cancelled() {
                    None
                } else {
                    event
                }
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl EventSender {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Deliver an event. Returns false when the receiver is gone or the
    /// stream was cancelled, in which case the caller should stop.
    pub async fn send(&self, event: CaptureEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

/// Read `body` to its end (or cancellation), delivering dispatched events
pub(crate) async fn pump<S, B, E>(mut body: S, sender: EventSender)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = FrameDecoder::new();
    let mut context = StreamContext::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = sender.cancelled() => {
                debug!("stream cancelled, releasing body");
                return;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                decoder.push(chunk.as_ref());
                if !deliver_frames(&mut decoder, &mut context, &sender).await {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "stream read failed");
                if let Some(event) = context.fail(e.to_string()) {
                    sender.send(event).await;
                }
                return;
            }
            None => {
                decoder.finish();
                if let Some(event) = context.end_of_stream() {
                    sender.send(event).await;
                }
                return;
            }
        }
    }
}

/// Deliver every complete frame. Returns false once the stream should stop.
async fn deliver_frames(
    decoder: &mut FrameDecoder,
    context: &mut StreamContext,
    sender: &EventSender,
) -> bool {
    while let Some(frame) = decoder.next_frame() {
        let Some(event) = envelope::parse(&frame).and_then(|e| context.dispatch(e)) else {
            continue;
        };
        if !sender.send(event).await {
            debug!("receiver gone, stopping stream");
            return false;
        }
        if context.is_finished() {
            return false;
        }
    }
    true
}
