// Local crates
use crate::decoder::frame::Payload;

// External crates
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Identity of a connected sink inside a [`Broadcaster`](super::broadcaster::Broadcaster).
pub type SinkId = u64;

/// Why a payload could not be handed to a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The consumer is not keeping up with the publish rate.
    #[error("sink queue is full")]
    Full,
    /// The consumer went away or the sink was already closed.
    #[error("sink is closed")]
    Closed,
    /// Writing to the underlying transport failed.
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One consumer of broadcast payloads.
///
/// `try_write` must not block; the broadcaster calls it for every sink on
/// every payload from the decode path.
pub trait Sink: Send + Sync + fmt::Debug {
    /// Identity used as the key in the sink set.
    fn id(&self) -> SinkId;

    /// Hand one payload to the sink.
    fn try_write(&self, payload: &Payload) -> Result<(), SinkError>;

    /// Release the sink. Called at most once by the broadcaster, after the
    /// sink was removed from the set.
    fn close(&self);
}

/// Sink backed by a bounded queue that a connection task drains to its
/// socket.
#[derive(Debug)]
pub struct ChannelSink {
    id: SinkId,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<Payload>,
    closed: CancellationToken,
}

/// Receiving half of a [`ChannelSink`], owned by the connection task.
#[derive(Debug)]
pub struct SinkReceiver {
    /// Payloads queued for this consumer, in publish order.
    pub rx: mpsc::Receiver<Payload>,
    /// Cancelled when the broadcaster closes the sink.
    pub closed: CancellationToken,
}

impl ChannelSink {
    /// Create a sink with room for `capacity` undelivered payloads.
    pub fn new(id: SinkId, peer: Option<SocketAddr>, capacity: usize) -> (Arc<Self>, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();

        let sink = Arc::new(Self {
            id,
            peer,
            tx,
            closed: closed.clone(),
        });

        (sink, SinkReceiver { rx, closed })
    }

    /// Remote address of the consumer, when the sink wraps a socket.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Sink for ChannelSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn try_write(&self, payload: &Payload) -> Result<(), SinkError> {
        if self.closed.is_cancelled() {
            return Err(SinkError::Closed);
        }

        self.tx.try_send(*payload).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
