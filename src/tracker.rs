//! Cluster membership tracking and failure detection.
//!
//! Tracks which peers are linked, times out peers that go silent, and
//! fans cluster events out to subscribers. A node identity that dies is
//! dead forever: the highest dead epoch per address is remembered, and
//! link attempts or frames from that epoch or older are refused. A
//! restarted process mints a higher epoch and joins as a new node.

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::node::NodeId;

/// Connection status of a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Never linked, or not currently known.
    Unconnected,
    /// Link established and alive.
    Connected,
    /// Declared dead. Terminal for this identity; only a restart with a
    /// fresh epoch can bring the address back.
    Dead,
}

/// Cluster-level membership changes delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A peer completed its link and is being synchronized.
    NodeUp(NodeId),
    /// A peer was declared dead. Its directory entries are already purged
    /// when subscribers observe this event.
    NodeDown(NodeId),
}

impl ClusterEvent {
    /// The node the event refers to.
    pub const fn node(&self) -> NodeId {
        match self {
            ClusterEvent::NodeUp(node) => *node,
            ClusterEvent::NodeDown(node) => *node,
        }
    }

    /// Returns true for `NodeUp`.
    pub const fn is_up(&self) -> bool {
        matches!(self, ClusterEvent::NodeUp(_))
    }
}

/// Outcome of admitting a new link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAdmission {
    /// Link accepted. When the peer's address was previously linked under
    /// an older epoch, that identity is reported for teardown.
    Admitted {
        /// Older identity at the same address that this link replaces.
        replaced: Option<NodeId>,
    },
    /// This exact identity is already linked.
    AlreadyConnected,
    /// The identity's epoch is not newer than one already seen dead or
    /// connected at its address.
    StaleEpoch,
}

/// Counters describing tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TrackerStats {
    /// Currently linked peers.
    pub connected: usize,
    /// Addresses with at least one dead epoch recorded.
    pub dead_addresses: usize,
    /// Active event subscribers.
    pub subscribers: usize,
}

#[derive(Debug)]
struct PeerRecord {
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct TrackerInner {
    peers: HashMap<NodeId, PeerRecord>,
    /// Highest epoch that died at each address. Only grows.
    dead_epochs: HashMap<SocketAddr, u64>,
}

/// Tracks peer liveness and publishes cluster events.
#[derive(Debug)]
pub struct Tracker {
    inner: RwLock<TrackerInner>,
    subscribers: Mutex<Vec<Sender<ClusterEvent>>>,
    subscriber_capacity: usize,
}

impl Tracker {
    /// Create a tracker whose subscriber channels hold `subscriber_capacity`
    /// events each.
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(TrackerInner::default()),
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    /// Admit a freshly linked peer.
    pub fn link_up(&self, node: NodeId) -> LinkAdmission {
        let mut inner = self.inner.write();

        if let Some(dead) = inner.dead_epochs.get(&node.addr()) {
            if node.epoch() <= *dead {
                return LinkAdmission::StaleEpoch;
            }
        }

        let existing = inner
            .peers
            .keys()
            .find(|peer| peer.addr() == node.addr())
            .copied();
        if let Some(existing) = existing {
            if existing == node {
                // A new physical link for a known identity is proof of
                // life.
                if let Some(record) = inner.peers.get_mut(&node) {
                    record.last_seen = Instant::now();
                }
                return LinkAdmission::AlreadyConnected;
            }
            if existing.epoch() > node.epoch() {
                // A delayed handshake from an epoch the address already
                // moved past.
                return LinkAdmission::StaleEpoch;
            }
            // The address restarted under a new epoch while the old link
            // was still considered alive.
            inner.peers.remove(&existing);
            let dead = inner.dead_epochs.entry(existing.addr()).or_insert(0);
            *dead = (*dead).max(existing.epoch());
            inner.peers.insert(
                node,
                PeerRecord {
                    last_seen: Instant::now(),
                },
            );
            return LinkAdmission::Admitted {
                replaced: Some(existing),
            };
        }

        inner.peers.insert(
            node,
            PeerRecord {
                last_seen: Instant::now(),
            },
        );
        LinkAdmission::Admitted { replaced: None }
    }

    /// Declare a peer dead.
    ///
    /// Returns true if the peer was linked; false makes repeated downs
    /// (link loss racing the failure timeout) harmless.
    pub fn link_down(&self, node: &NodeId) -> bool {
        let mut inner = self.inner.write();
        if inner.peers.remove(node).is_none() {
            return false;
        }
        let dead = inner.dead_epochs.entry(node.addr()).or_insert(0);
        *dead = (*dead).max(node.epoch());
        true
    }

    /// Record proof of life for a peer. Called for every inbound frame.
    pub fn heartbeat(&self, node: &NodeId) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.peers.get_mut(node) {
            record.last_seen = Instant::now();
        }
    }

    /// Peers that have been silent longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) >= timeout)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Connection status of a node identity.
    pub fn status(&self, node: &NodeId) -> PeerStatus {
        let inner = self.inner.read();
        if inner.peers.contains_key(node) {
            return PeerStatus::Connected;
        }
        match inner.dead_epochs.get(&node.addr()) {
            Some(dead) if node.epoch() <= *dead => PeerStatus::Dead,
            _ => PeerStatus::Unconnected,
        }
    }

    /// Whether this identity's epoch has been superseded at its address.
    pub fn is_stale(&self, node: &NodeId) -> bool {
        let inner = self.inner.read();
        matches!(inner.dead_epochs.get(&node.addr()), Some(dead) if node.epoch() <= *dead)
    }

    /// Whether any identity at this address is currently linked.
    pub fn is_addr_linked(&self, addr: SocketAddr) -> bool {
        let inner = self.inner.read();
        inner.peers.keys().any(|peer| peer.addr() == addr)
    }

    /// All currently linked peers.
    pub fn connected(&self) -> Vec<NodeId> {
        self.inner.read().peers.keys().copied().collect()
    }

    /// Number of currently linked peers.
    pub fn connected_count(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Subscribe to cluster events.
    ///
    /// Events published after this call are delivered in order. A
    /// subscriber that stops draining loses events once its channel fills.
    pub fn subscribe(&self) -> Receiver<ClusterEvent> {
        let (tx, rx) = async_channel::bounded(self.subscriber_capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: ClusterEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(?event, "cluster event dropped for slow subscriber");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Counters describing tracker state.
    pub fn stats(&self) -> TrackerStats {
        let inner = self.inner.read();
        TrackerStats {
            connected: inner.peers.len(),
            dead_addresses: inner.dead_epochs.len(),
            subscribers: self.subscribers.lock().len(),
        }
    }
}
