//! Transport abstraction for registry frame delivery.
//!
//! A transport maintains reliable, ordered point-to-point links between
//! nodes. The registry hands it encoded frames for specific peers and
//! drains one ordered stream of inbound frames and link events from it.
//!
//! Link loss must be surfaced promptly: when a peer's link drops, the
//! transport emits [`LinkEvent::Down`] so the registry can purge the peer
//! well inside its failure timeout instead of waiting for it.
//!
//! # Available Transports
//!
//! - [`TcpTransport`](tcp::TcpTransport): length-prefixed frames over TCP
//!   (requires the `tcp` feature)
//! - [`MemoryTransport`](crate::testing::MemoryTransport): in-process hub
//!   for tests
//! - [`NoopTransport`]: discards all frames

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;

use crate::node::NodeId;

#[cfg(feature = "tcp")]
pub mod tcp;

/// Errors produced by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live link to the target, or its outbound queue is full.
    #[error("peer {0} unreachable")]
    PeerUnreachable(NodeId),

    /// Dialing a peer did not complete in time.
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Address being dialed.
        addr: SocketAddr,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The peer refused the handshake or presented an unacceptable
    /// identity.
    #[error("handshake with {addr} rejected: {reason}")]
    HandshakeRejected {
        /// Address of the rejecting side.
        addr: SocketAddr,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// Binding the listen address failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// IO error on an established link.
    #[error("transport IO error: {0}")]
    Io(#[source] std::io::Error),

    /// An inbound or outbound frame exceeds the configured limit.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame violated the transport framing rules.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            // Transient errors - the peer may come back or the queue may
            // drain.
            TransportError::PeerUnreachable(_)
            | TransportError::ConnectTimeout { .. }
            | TransportError::Io(_) => true,

            // Permanent errors - retrying the same operation cannot help.
            TransportError::HandshakeRejected { .. }
            | TransportError::Bind(_)
            | TransportError::FrameTooLarge { .. }
            | TransportError::BadFrame(_)
            | TransportError::Closed => false,
        }
    }

    /// Whether the operation can never succeed as issued.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// Link state changes reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A link to this peer completed its handshake.
    Up(NodeId),
    /// The link to this peer was lost or closed.
    Down(NodeId),
}

impl LinkEvent {
    /// The peer the event refers to.
    pub const fn node(&self) -> NodeId {
        match self {
            LinkEvent::Up(node) => *node,
            LinkEvent::Down(node) => *node,
        }
    }
}

/// Everything a transport delivers to the registry.
///
/// Frames and link events share one stream so their relative order is
/// preserved per peer: `Up` arrives before the peer's first frame, `Down`
/// after its last. Two receivers would let a peer's snapshot race ahead
/// of its own link-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A frame received from a linked peer.
    Frame(NodeId, Bytes),
    /// A link state change.
    Link(LinkEvent),
}

/// Inbound side of a transport, consumed by the registry.
#[derive(Debug)]
pub struct TransportMailbox {
    /// Ordered stream of frames and link events.
    pub events: Receiver<TransportEvent>,
}

/// Sending side of a [`TransportMailbox`], held by the transport.
#[derive(Debug, Clone)]
pub struct MailboxSender {
    /// Producer for the event stream.
    pub events: Sender<TransportEvent>,
}

impl TransportMailbox {
    /// Create a connected mailbox pair with the given channel capacity.
    pub fn channel(capacity: usize) -> (MailboxSender, TransportMailbox) {
        let (events_tx, events_rx) = async_channel::bounded(capacity);
        (
            MailboxSender { events: events_tx },
            TransportMailbox { events: events_rx },
        )
    }
}

/// Reliable ordered point-to-point frame delivery between nodes.
///
/// Implementations own their sockets and background tasks; the registry
/// only calls into this trait and drains the [`TransportMailbox`] returned
/// at construction.
#[auto_impl::auto_impl(Box, Arc)]
pub trait Transport: Send + Sync + 'static {
    /// Identity of the local node on this transport.
    fn local_node(&self) -> NodeId;

    /// Send a frame to a linked peer.
    ///
    /// Fails fast with [`TransportError::PeerUnreachable`] when no live
    /// link to the target exists or its outbound queue is full; it never
    /// blocks on a slow peer.
    fn send_to(
        &self,
        target: &NodeId,
        frame: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Establish a link to a peer by address.
    ///
    /// Resolves to the peer's identity once the handshake completes.
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<NodeId, TransportError>> + Send;

    /// Tear down the link to a peer, if one exists.
    fn disconnect(&self, node: &NodeId) -> impl Future<Output = ()> + Send;

    /// Shut the transport down and close every link.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

/// A transport with no network: sends succeed and vanish, connects fail.
///
/// Useful for exercising the registry's local operations in tests. The
/// mailbox stays open but never yields anything.
#[derive(Debug, Clone)]
pub struct NoopTransport {
    local: NodeId,
    // Keeps the mailbox receivers alive.
    _mailbox: MailboxSender,
}

impl NoopTransport {
    /// Create a no-op transport for the given identity.
    pub fn new(local: NodeId) -> (Self, TransportMailbox) {
        let (sender, mailbox) = TransportMailbox::channel(1);
        (
            Self {
                local,
                _mailbox: sender,
            },
            mailbox,
        )
    }
}

impl Transport for NoopTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn send_to(&self, _target: &NodeId, _frame: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, _addr: SocketAddr) -> Result<NodeId, TransportError> {
        Err(TransportError::Closed)
    }

    async fn disconnect(&self, _node: &NodeId) {}

    async fn shutdown(&self) {}
}
