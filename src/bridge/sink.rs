//! Event sink
//!
//! Producers never touch the client connection. They push events into a
//! bounded queue, and one writer task per connection drains it onto the
//! transport, so at most one write is ever in flight. The same task watches
//! the read half for the client going away and cancels every producer when
//! it does.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use super::event::{Event, Frame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("event sink closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Write half of a client connection
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError>;
}

/// Read half of a client connection; only used to notice disconnects
#[async_trait]
pub trait FrameReader: Send {
    /// Resolve once the client has closed the connection or it failed.
    /// Must be cancel-safe: the writer re-polls it between writes.
    async fn wait_closed(&mut self);
}

// ============================================================================
// Producer side
// ============================================================================

/// Cloneable handle producers send events through
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Create a sink and the queue its writer drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event, waiting while the queue is full.
    /// Fails only once the writer has stopped.
    pub async fn send(&self, event: Event) -> Result<(), SinkError> {
        self.tx.send(event).await.map_err(|_| SinkError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Writer task
// ============================================================================

/// Single consumer of a connection's event queue
pub struct SinkWriter<W, R> {
    writer: W,
    reader: R,
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
}

impl<W: FrameWriter, R: FrameReader> SinkWriter<W, R> {
    pub fn new(writer: W, reader: R, events: mpsc::Receiver<Event>, cancel: CancellationToken) -> Self {
        Self {
            writer,
            reader,
            events,
            cancel,
        }
    }

    /// Drain events until every producer is done or the client is gone.
    ///
    /// Returns the number of event frames written. A close frame is sent
    /// only when the producers finished on their own.
    pub async fn run(self) -> u64 {
        let SinkWriter {
            mut writer,
            mut reader,
            mut events,
            cancel,
        } = self;
        let mut written = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = reader.wait_closed() => {
                    info!("Client closed the connection");
                    cancel.cancel();
                    return written;
                }

                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = writer.write_frame(event.to_frame()).await {
                            info!("Client write failed: {}", e);
                            cancel.cancel();
                            return written;
                        }
                        written += 1;
                    }
                    None => {
                        debug!("All producers finished, closing connection");
                        if let Err(e) = writer.write_frame(Frame::Close).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        return written;
                    }
                }
            }
        }
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// Create a connected writer/reader pair plus the client's end of it.
///
/// Frames written by the bridge arrive on [`ClientEnd::next_frame`];
/// dropping or closing the client end makes the reader report a disconnect.
pub fn channel_transport() -> (ChannelWriter, ChannelReader, ClientEnd) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    (
        ChannelWriter { tx },
        ChannelReader {
            closed: closed.clone(),
        },
        ClientEnd {
            frames: rx,
            _hangup: closed.drop_guard(),
        },
    )
}

pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        self.tx
            .send(frame)
            .map_err(|_| SinkError::Transport("client end dropped".to_string()))
    }
}

pub struct ChannelReader {
    closed: CancellationToken,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn wait_closed(&mut self) {
        self.closed.cancelled().await
    }
}

/// The client's side of a [`channel_transport`]
pub struct ClientEnd {
    frames: mpsc::UnboundedReceiver<Frame>,
    _hangup: DropGuard,
}

impl ClientEnd {
    /// Next frame from the bridge; `None` once the writer is gone
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Hang up, as a client closing its socket would
    pub fn close(self) {
        drop(self)
    }
}
