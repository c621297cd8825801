//! In-memory transport and chaos utilities for tests.
//!
//! A [`MemoryHub`] routes frames between [`MemoryTransport`] endpoints
//! without sockets, so whole clusters run inside one test process.
//! Failures are injected through the hub:
//!
//! - **Message loss**: drop frames with a configured probability
//! - **Partitions**: block pairs of addresses from talking
//! - **Latency**: slow links down, with optional jitter
//! - **Crashes**: [`kill`](MemoryHub::kill) drops a node without goodbye
//!
//! ## Example
//!
//! ```ignore
//! use groupcast::testing::{ChaosConfig, MemoryHub};
//!
//! let hub = MemoryHub::new();
//! let (alpha, alpha_mailbox) = hub.transport("10.0.0.1:7400".parse().unwrap());
//! let (beta, beta_mailbox) = hub.transport("10.0.0.2:7400".parse().unwrap());
//!
//! hub.set_chaos(ChaosConfig::new().with_message_loss_rate(0.05));
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_timer::Delay;
use parking_lot::RwLock;
use rand::Rng;

use crate::node::NodeId;
use crate::transport::{
    LinkEvent, MailboxSender, Transport, TransportError, TransportEvent, TransportMailbox,
};

const MEMORY_MAILBOX_CAPACITY: usize = 1024;

/// Failure injection knobs shared by all links of a hub.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of dropping a frame (0.0 to 1.0).
    pub message_loss_rate: f64,

    /// Delay applied to every frame.
    pub base_latency: Duration,

    /// Random extra delay (0 to this value) on top of the base.
    pub latency_jitter: Duration,

    /// Whether any of the above is applied.
    pub enabled: bool,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            message_loss_rate: 0.0,
            base_latency: Duration::ZERO,
            latency_jitter: Duration::ZERO,
            enabled: false,
        }
    }
}

impl ChaosConfig {
    /// No chaos.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moderate failure testing: 5% loss, 10ms latency with 20ms jitter.
    pub fn moderate() -> Self {
        Self {
            message_loss_rate: 0.05,
            base_latency: Duration::from_millis(10),
            latency_jitter: Duration::from_millis(20),
            enabled: true,
        }
    }

    /// Aggressive failure testing: 20% loss, 50ms latency with 100ms
    /// jitter.
    pub fn aggressive() -> Self {
        Self {
            message_loss_rate: 0.20,
            base_latency: Duration::from_millis(50),
            latency_jitter: Duration::from_millis(100),
            enabled: true,
        }
    }

    /// Set the frame loss rate (builder pattern).
    pub fn with_message_loss_rate(mut self, rate: f64) -> Self {
        self.message_loss_rate = rate.clamp(0.0, 1.0);
        self.enabled = true;
        self
    }

    /// Set the base latency (builder pattern).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.base_latency = latency;
        self.enabled = true;
        self
    }

    /// Set the latency jitter (builder pattern).
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.latency_jitter = jitter;
        self.enabled = true;
        self
    }

    fn should_drop(&self) -> bool {
        if !self.enabled || self.message_loss_rate == 0.0 {
            return false;
        }
        rand::rng().random::<f64>() < self.message_loss_rate
    }

    fn latency(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let jitter = if self.latency_jitter > Duration::ZERO {
            let range = self.latency_jitter.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(0..=range))
        } else {
            Duration::ZERO
        };
        self.base_latency + jitter
    }
}

/// Address pairs that cannot talk to each other.
#[derive(Debug, Default)]
pub struct Partition {
    blocked: RwLock<HashSet<(SocketAddr, SocketAddr)>>,
    active: AtomicBool,
}

impl Partition {
    /// No partitions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block traffic between two addresses, both directions.
    pub fn split(&self, a: SocketAddr, b: SocketAddr) {
        let mut blocked = self.blocked.write();
        blocked.insert((a, b));
        blocked.insert((b, a));
        self.active.store(true, Ordering::Release);
    }

    /// Restore traffic between two addresses.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut blocked = self.blocked.write();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
        if blocked.is_empty() {
            self.active.store(false, Ordering::Release);
        }
    }

    /// Restore all traffic.
    pub fn heal_all(&self) {
        self.blocked.write().clear();
        self.active.store(false, Ordering::Release);
    }

    /// Cut one address off from a set of others.
    pub fn isolate(&self, addr: SocketAddr, others: impl IntoIterator<Item = SocketAddr>) {
        for other in others {
            self.split(addr, other);
        }
    }

    /// Whether traffic from `from` to `to` is blocked.
    pub fn is_blocked(&self, from: SocketAddr, to: SocketAddr) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.blocked.read().contains(&(from, to))
    }
}

/// Frame counters collected by a hub.
#[derive(Debug, Default)]
pub struct ChaosStats {
    /// Frames offered to the hub.
    pub frames_total: AtomicU64,
    /// Frames dropped by the loss rate.
    pub frames_dropped: AtomicU64,
    /// Frames blocked by a partition.
    pub frames_partitioned: AtomicU64,
    /// Frames that were delayed.
    pub frames_delayed: AtomicU64,
}

impl ChaosStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> ChaosStatsSnapshot {
        ChaosStatsSnapshot {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_partitioned: self.frames_partitioned.load(Ordering::Relaxed),
            frames_delayed: self.frames_delayed.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.frames_total.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.frames_partitioned.store(0, Ordering::Relaxed);
        self.frames_delayed.store(0, Ordering::Relaxed);
    }
}

/// Copy of [`ChaosStats`] at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct ChaosStatsSnapshot {
    /// Frames offered to the hub.
    pub frames_total: u64,
    /// Frames dropped by the loss rate.
    pub frames_dropped: u64,
    /// Frames blocked by a partition.
    pub frames_partitioned: u64,
    /// Frames that were delayed.
    pub frames_delayed: u64,
}

impl ChaosStatsSnapshot {
    /// Fraction of offered frames that got through.
    pub fn delivery_rate(&self) -> f64 {
        if self.frames_total == 0 {
            return 1.0;
        }
        let failed = self.frames_dropped + self.frames_partitioned;
        1.0 - (failed as f64 / self.frames_total as f64)
    }
}

#[derive(Clone)]
struct Endpoint {
    node: NodeId,
    mailbox: MailboxSender,
    links: Arc<RwLock<HashSet<NodeId>>>,
}

struct HubInner {
    endpoints: RwLock<HashMap<SocketAddr, Endpoint>>,
    partition: Partition,
    chaos: RwLock<ChaosConfig>,
    stats: ChaosStats,
}

impl HubInner {
    /// Decide the fate of one frame: `None` drops it, `Some(latency)`
    /// delivers it after the delay.
    fn clearance(&self, from: SocketAddr, to: SocketAddr) -> Option<Duration> {
        self.stats.frames_total.fetch_add(1, Ordering::Relaxed);
        if self.partition.is_blocked(from, to) {
            self.stats.frames_partitioned.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let chaos = self.chaos.read();
        if chaos.should_drop() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let latency = chaos.latency();
        if latency > Duration::ZERO {
            self.stats.frames_delayed.fetch_add(1, Ordering::Relaxed);
        }
        Some(latency)
    }

    fn drop_endpoint(&self, addr: SocketAddr) {
        let Some(victim) = self.endpoints.write().remove(&addr) else {
            return;
        };
        victim.mailbox.events.close();
        // Every peer that was linked to the victim sees the link die.
        for endpoint in self.endpoints.read().values() {
            if endpoint.links.write().remove(&victim.node) {
                push_event(
                    &endpoint.mailbox,
                    TransportEvent::Link(LinkEvent::Down(victim.node)),
                );
            }
        }
    }
}

/// In-memory frame router shared by a set of [`MemoryTransport`]s.
///
/// Cheap to clone; all clones control the same hub.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: RwLock::new(HashMap::new()),
                partition: Partition::new(),
                chaos: RwLock::new(ChaosConfig::default()),
                stats: ChaosStats::default(),
            }),
        }
    }

    /// Create a transport bound to an address, with a fresh epoch.
    ///
    /// Re-binding an occupied address evicts the previous endpoint as if
    /// it had been [killed](Self::kill); this is how a node restart is
    /// simulated.
    pub fn transport(&self, addr: SocketAddr) -> (MemoryTransport, TransportMailbox) {
        self.transport_with_node(NodeId::fresh(addr))
    }

    /// Create a transport with a fully pinned identity.
    pub fn transport_with_node(&self, node: NodeId) -> (MemoryTransport, TransportMailbox) {
        self.inner.drop_endpoint(node.addr());

        let (sender, mailbox) = TransportMailbox::channel(MEMORY_MAILBOX_CAPACITY);
        let links = Arc::new(RwLock::new(HashSet::new()));
        self.inner.endpoints.write().insert(
            node.addr(),
            Endpoint {
                node,
                mailbox: sender.clone(),
                links: Arc::clone(&links),
            },
        );

        let transport = MemoryTransport {
            inner: Arc::new(MemoryInner {
                local: node,
                hub: Arc::clone(&self.inner),
                links,
                mailbox: sender,
                shutdown: AtomicBool::new(false),
            }),
        };
        (transport, mailbox)
    }

    /// Crash a node: its endpoint vanishes and every linked peer gets a
    /// link-down, with no goodbye.
    pub fn kill(&self, node: &NodeId) {
        let current = self.inner.endpoints.read().get(&node.addr()).map(|e| e.node);
        if current == Some(*node) {
            self.inner.drop_endpoint(node.addr());
        }
    }

    /// Identity currently bound at an address.
    pub fn node_at(&self, addr: SocketAddr) -> Option<NodeId> {
        self.inner.endpoints.read().get(&addr).map(|e| e.node)
    }

    /// Block traffic between two addresses, both directions.
    pub fn split(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.partition.split(a, b);
    }

    /// Restore traffic between two addresses.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.inner.partition.heal(a, b);
    }

    /// Restore all traffic.
    pub fn heal_all(&self) {
        self.inner.partition.heal_all();
    }

    /// Cut one address off from a set of others.
    pub fn isolate(&self, addr: SocketAddr, others: impl IntoIterator<Item = SocketAddr>) {
        self.inner.partition.isolate(addr, others);
    }

    /// Replace the chaos configuration.
    pub fn set_chaos(&self, config: ChaosConfig) {
        *self.inner.chaos.write() = config;
    }

    /// Turn all chaos off and heal all partitions.
    pub fn calm(&self) {
        self.set_chaos(ChaosConfig::default());
        self.heal_all();
    }

    /// Current frame counters.
    pub fn stats(&self) -> ChaosStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

struct MemoryInner {
    local: NodeId,
    hub: Arc<HubInner>,
    links: Arc<RwLock<HashSet<NodeId>>>,
    mailbox: MailboxSender,
    shutdown: AtomicBool,
}

/// A [`Transport`] that routes frames through a [`MemoryHub`].
///
/// Connects install both link directions synchronously, so both sides
/// observe `LinkEvent::Up` before any frame. Chaos latency is served on
/// the sending call, which keeps per-link frame order intact.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    /// Peers this endpoint is linked to.
    pub fn linked(&self) -> Vec<NodeId> {
        self.inner.links.read().iter().copied().collect()
    }

    /// Sever the link in both directions without any events, as if the
    /// wire was cut. Both sides still believe they are linked.
    pub fn cut_link(&self, peer: &NodeId) {
        self.inner.links.write().remove(peer);
        if let Some(endpoint) = self.inner.hub.endpoints.read().get(&peer.addr()) {
            endpoint.links.write().remove(&self.inner.local);
        }
    }
}

impl Transport for MemoryTransport {
    fn local_node(&self) -> NodeId {
        self.inner.local
    }

    async fn send_to(&self, node: &NodeId, frame: Bytes) -> Result<(), TransportError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.inner.links.read().contains(node) {
            return Err(TransportError::PeerUnreachable(*node));
        }

        let endpoint = self.inner.hub.endpoints.read().get(&node.addr()).cloned();
        let endpoint = match endpoint {
            Some(endpoint) if endpoint.node == *node => endpoint,
            // The peer is gone or restarted; the link is dead.
            _ => {
                self.inner.links.write().remove(node);
                push_event(
                    &self.inner.mailbox,
                    TransportEvent::Link(LinkEvent::Down(*node)),
                );
                return Err(TransportError::PeerUnreachable(*node));
            }
        };

        match self.inner.hub.clearance(self.inner.local.addr(), node.addr()) {
            // Lost on the wire.
            None => Ok(()),
            Some(latency) => {
                if latency > Duration::ZERO {
                    Delay::new(latency).await;
                }
                push_event(
                    &endpoint.mailbox,
                    TransportEvent::Frame(self.inner.local, frame),
                );
                Ok(())
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<NodeId, TransportError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.inner.hub.partition.is_blocked(self.inner.local.addr(), addr) {
            return Err(TransportError::ConnectTimeout {
                addr,
                timeout_ms: 0,
            });
        }

        let endpoint = self.inner.hub.endpoints.read().get(&addr).cloned();
        let Some(endpoint) = endpoint else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no endpoint at address",
            )));
        };
        if endpoint.node == self.inner.local {
            return Err(TransportError::HandshakeRejected {
                addr,
                reason: "connection to self".to_string(),
            });
        }

        if !self.inner.links.write().insert(endpoint.node) {
            return Ok(endpoint.node);
        }
        endpoint.links.write().insert(self.inner.local);

        // Both sides see the link before any frame can cross it.
        push_event(
            &self.inner.mailbox,
            TransportEvent::Link(LinkEvent::Up(endpoint.node)),
        );
        push_event(
            &endpoint.mailbox,
            TransportEvent::Link(LinkEvent::Up(self.inner.local)),
        );
        Ok(endpoint.node)
    }

    async fn disconnect(&self, node: &NodeId) {
        if !self.inner.links.write().remove(node) {
            return;
        }
        push_event(
            &self.inner.mailbox,
            TransportEvent::Link(LinkEvent::Down(*node)),
        );

        if let Some(endpoint) = self.inner.hub.endpoints.read().get(&node.addr()).cloned() {
            if endpoint.node == *node && endpoint.links.write().remove(&self.inner.local) {
                push_event(
                    &endpoint.mailbox,
                    TransportEvent::Link(LinkEvent::Down(self.inner.local)),
                );
            }
        }
    }

    async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let addr = self.inner.local.addr();
        let still_mine = self.inner.hub.endpoints.read().get(&addr).map(|e| e.node)
            == Some(self.inner.local);
        if still_mine {
            self.inner.hub.drop_endpoint(addr);
        }
        self.inner.links.write().clear();
        self.inner.mailbox.events.close();
    }
}

/// Best-effort event push used by the in-memory transport.
fn push_event(mailbox: &MailboxSender, event: TransportEvent) {
    if let Err(err) = mailbox.events.try_send(event) {
        tracing::debug!(error = %err, "memory mailbox event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn addr2(port: u16) -> SocketAddr {
        format!("10.0.0.2:{port}").parse().unwrap()
    }

    async fn next_event(mailbox: &TransportMailbox) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), mailbox.events.recv())
            .await
            .expect("no transport event")
            .expect("mailbox closed")
    }

    #[test]
    fn test_chaos_config_builders() {
        let config = ChaosConfig::new()
            .with_message_loss_rate(1.5)
            .with_latency(Duration::from_millis(5))
            .with_jitter(Duration::from_millis(10));
        assert_eq!(config.message_loss_rate, 1.0);
        assert!(config.enabled);
        assert!(ChaosConfig::moderate().enabled);
        assert!(ChaosConfig::aggressive().message_loss_rate > ChaosConfig::moderate().message_loss_rate);
        assert!(!ChaosConfig::new().should_drop());
    }

    #[test]
    fn test_partition_blocks_both_directions() {
        let partition = Partition::new();
        partition.split(addr(1), addr2(1));
        assert!(partition.is_blocked(addr(1), addr2(1)));
        assert!(partition.is_blocked(addr2(1), addr(1)));
        assert!(!partition.is_blocked(addr(1), addr(2)));

        partition.heal(addr(1), addr2(1));
        assert!(!partition.is_blocked(addr(1), addr2(1)));
    }

    #[tokio::test]
    async fn test_connect_links_both_sides() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7400));
        let (beta, beta_mailbox) = hub.transport(addr2(7400));

        let peer = alpha.connect(addr2(7400)).await.unwrap();
        assert_eq!(peer, beta.local_node());
        assert_eq!(
            next_event(&alpha_mailbox).await,
            TransportEvent::Link(LinkEvent::Up(beta.local_node()))
        );
        assert_eq!(
            next_event(&beta_mailbox).await,
            TransportEvent::Link(LinkEvent::Up(alpha.local_node()))
        );

        alpha
            .send_to(&peer, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(
            next_event(&beta_mailbox).await,
            TransportEvent::Frame(alpha.local_node(), Bytes::from_static(b"ping"))
        );
    }

    #[tokio::test]
    async fn test_send_without_link_fails_fast() {
        let hub = MemoryHub::new();
        let (alpha, _alpha_mailbox) = hub.transport(addr(7401));
        let (beta, _beta_mailbox) = hub.transport(addr2(7401));

        let err = alpha
            .send_to(&beta.local_node(), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_kill_emits_link_down() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7402));
        let (beta, _beta_mailbox) = hub.transport(addr2(7402));

        let peer = alpha.connect(addr2(7402)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;

        hub.kill(&beta.local_node());
        assert_eq!(
            next_event(&alpha_mailbox).await,
            TransportEvent::Link(LinkEvent::Down(peer))
        );
        let err = alpha
            .send_to(&peer, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_partition_blocks_connect_and_frames() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7403));
        let (_beta, beta_mailbox) = hub.transport(addr2(7403));

        let peer = alpha.connect(addr2(7403)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;
        let _ = next_event(&beta_mailbox).await;

        hub.split(addr(7403), addr2(7403));
        alpha
            .send_to(&peer, Bytes::from_static(b"lost"))
            .await
            .unwrap();
        assert!(beta_mailbox.events.try_recv().is_err());
        assert_eq!(hub.stats().frames_partitioned, 1);

        let (gamma, _gamma_mailbox) = hub.transport("10.0.0.3:7403".parse().unwrap());
        hub.split("10.0.0.3:7403".parse().unwrap(), addr2(7403));
        let err = gamma.connect(addr2(7403)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectTimeout { .. }));

        hub.heal_all();
        alpha
            .send_to(&peer, Bytes::from_static(b"back"))
            .await
            .unwrap();
        assert_eq!(
            next_event(&beta_mailbox).await,
            TransportEvent::Frame(alpha.local_node(), Bytes::from_static(b"back"))
        );
    }

    #[tokio::test]
    async fn test_full_loss_drops_everything() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7404));
        let (_beta, beta_mailbox) = hub.transport(addr2(7404));

        let peer = alpha.connect(addr2(7404)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;
        let _ = next_event(&beta_mailbox).await;

        hub.set_chaos(ChaosConfig::new().with_message_loss_rate(1.0));
        for _ in 0..10 {
            alpha
                .send_to(&peer, Bytes::from_static(b"void"))
                .await
                .unwrap();
        }
        assert!(beta_mailbox.events.try_recv().is_err());
        assert_eq!(hub.stats().frames_dropped, 10);
        assert_eq!(hub.stats().delivery_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_latency_delays_delivery() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7405));
        let (_beta, beta_mailbox) = hub.transport(addr2(7405));

        let peer = alpha.connect(addr2(7405)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;
        let _ = next_event(&beta_mailbox).await;

        hub.set_chaos(ChaosConfig::new().with_latency(Duration::from_millis(30)));
        let start = std::time::Instant::now();
        alpha
            .send_to(&peer, Bytes::from_static(b"slow"))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(
            next_event(&beta_mailbox).await,
            TransportEvent::Frame(alpha.local_node(), Bytes::from_static(b"slow"))
        );
    }

    #[tokio::test]
    async fn test_rebind_evicts_previous_endpoint() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7406));
        let (_beta, _beta_mailbox) = hub.transport_with_node(NodeId::new(addr2(7406), 5));
        let old = alpha.connect(addr2(7406)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;

        // Same address comes back with a later epoch.
        let (beta2, _beta2_mailbox) = hub.transport_with_node(NodeId::new(addr2(7406), 6));
        assert_eq!(
            next_event(&alpha_mailbox).await,
            TransportEvent::Link(LinkEvent::Down(old))
        );
        assert_eq!(hub.node_at(addr2(7406)), Some(beta2.local_node()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_endpoint() {
        let hub = MemoryHub::new();
        let (alpha, alpha_mailbox) = hub.transport(addr(7407));
        let (beta, beta_mailbox) = hub.transport(addr2(7407));
        let peer = alpha.connect(addr2(7407)).await.unwrap();
        let _ = next_event(&alpha_mailbox).await;
        let _ = next_event(&beta_mailbox).await;

        beta.shutdown().await;
        assert_eq!(
            next_event(&alpha_mailbox).await,
            TransportEvent::Link(LinkEvent::Down(peer))
        );
        assert!(hub.node_at(addr2(7407)).is_none());
        assert!(matches!(
            beta.send_to(&alpha.local_node(), Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
