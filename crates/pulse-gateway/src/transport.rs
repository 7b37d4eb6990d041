//! Transport seam between the gateway and the socket write task.
//!
//! The gateway never touches a socket directly: each connection owns a
//! [`Transport`] whose production implementation ([`ChannelTransport`])
//! forwards frames over an mpsc channel to the connection's write task.
//! Tests substitute failing implementations to exercise retry, zombie
//! classification, and close races.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport-level write failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer endpoint is gone.
    #[error("transport closed")]
    Closed,
    /// The outbound buffer is full (slow client).
    #[error("transport backpressure")]
    Backpressure,
    /// The write did not complete in time.
    #[error("transport timed out")]
    Timeout,
}

/// Write side of one live connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one serialized frame.
    async fn send(&self, message: Arc<String>) -> Result<(), TransportError>;

    /// Release the transport. Idempotent.
    async fn close(&self);

    /// Whether the transport still reports itself open.
    ///
    /// This is the socket-state flag only — a transport can report open
    /// while the remote peer is unresponsive. Health decisions must be based
    /// on actual write outcomes, not this flag.
    fn is_open(&self) -> bool;
}

/// Channel-backed transport: frames go to the connection's write task.
///
/// Sends are non-blocking; a full channel is a failed write
/// ([`TransportError::Backpressure`]) so slow clients degrade instead of
/// stalling the emitter.
pub struct ChannelTransport {
    tx: mpsc::Sender<Arc<String>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Wrap a sender to a write task.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Build a transport plus the receiver a write task would drain.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Arc<String>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}
