//! Link identity and the handle the registry uses to reach a link's task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::protocol::Envelope;

/// Unique identifier for one accepted link.
///
/// Wraps a UUID v4 generated when the link is accepted. A rover that
/// reconnects gets a new `LinkId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(uuid::Uuid);

impl LinkId {
    /// Creates a new random `LinkId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for LinkId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

/// Why an envelope could not be queued for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkSendError {
    /// The outbound queue is full.
    #[error("outbound queue full")]
    Full,
    /// The link task has exited.
    #[error("link closed")]
    Closed,
}

/// Registry-side handle to one link.
///
/// Cloning is cheap; all clones feed the same outbound queue.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Envelope>,
    close: Arc<watch::Sender<bool>>,
}

/// Task-side ends of a link created by [`LinkHandle::channel`].
#[derive(Debug)]
pub struct LinkReceiver {
    /// Envelopes queued for the socket, in send order.
    pub outbound: mpsc::Receiver<Envelope>,
    /// Becomes `true` when the registry wants the link closed.
    pub close: watch::Receiver<bool>,
}

impl LinkHandle {
    /// Creates a handle with a bounded outbound queue of `capacity`.
    #[must_use]
    pub fn channel(remote_addr: Option<SocketAddr>, capacity: usize) -> (Self, LinkReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            id: LinkId::new(),
            remote_addr,
            outbound: outbound_tx,
            close: Arc::new(close_tx),
        };
        let receiver = LinkReceiver {
            outbound: outbound_rx,
            close: close_rx,
        };
        (handle, receiver)
    }

    /// The link's id.
    #[must_use]
    pub const fn id(&self) -> LinkId {
        self.id
    }

    /// Peer address, if the transport reported one.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queues an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LinkSendError`] if the queue is full or the link task has
    /// gone away.
    pub fn send(&self, envelope: Envelope) -> Result<(), LinkSendError> {
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkSendError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkSendError::Closed,
        })
    }

    /// Asks the link task to close the socket.
    pub fn request_close(&self) {
        self.close.send_replace(true);
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn link_ids_are_unique() {
        assert_ne!(LinkId::new(), LinkId::new());
        assert_eq!(LinkId::new().to_string().len(), 36);
    }

    #[test]
    fn send_respects_capacity() {
        let (handle, mut rx) = LinkHandle::channel(None, 1);
        assert_eq!(handle.send(Envelope::ping()), Ok(()));
        assert_eq!(handle.send(Envelope::ping()), Err(LinkSendError::Full));

        let Ok(env) = rx.outbound.try_recv() else {
            panic!("queued envelope should be readable");
        };
        assert_eq!(env.msg_type, crate::protocol::MessageType::Ping);

        drop(rx);
        assert_eq!(handle.send(Envelope::pong()), Err(LinkSendError::Closed));
    }

    #[test]
    fn close_request_is_observable() {
        let (handle, rx) = LinkHandle::channel(None, 4);
        assert!(!*rx.close.borrow());
        handle.clone().request_close();
        assert!(*rx.close.borrow());
    }
}
