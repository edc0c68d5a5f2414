//! Consumer transport boundary.
//!
//! The relay only needs to push bytes at a consumer and to learn when the
//! consumer has gone away. Network framing lives outside this crate.

use crate::error::{RelayError, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outbound half of a consumer connection.
pub trait Transport: Send + Sync {
    /// Hand one message to the consumer.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Whether the consumer has disconnected.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, payload: &[u8]) -> Result<()> {
        (**self).send(payload)
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// In-process transport backed by a crossbeam channel.
pub struct ChannelTransport {
    sender: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Consumer side of a [`ChannelTransport`]. Dropping it closes the transport.
pub struct TransportReceiver {
    receiver: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Create a connected transport/receiver pair.
    pub fn pair() -> (ChannelTransport, TransportReceiver) {
        let (sender, receiver) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        (
            ChannelTransport {
                sender,
                closed: Arc::clone(&closed),
            },
            TransportReceiver { receiver, closed },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::TransportClosed);
        }
        self.sender
            .send(payload.to_vec())
            .map_err(|_| RelayError::TransportClosed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportReceiver {
    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Vec<u8>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything delivered so far, without blocking.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.receiver.try_iter().collect()
    }

    /// Disconnect from the relay side.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for TransportReceiver {
    fn drop(&mut self) {
        self.close();
    }
}
