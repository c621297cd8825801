//! The group registry: one node's entry point to the cluster.
//!
//! A [`Registry`] owns the local member table, the replicated group
//! [`Directory`], the cluster [`Tracker`], and the gossip plumbing that
//! keeps peers converged. It is generic over a [`Transport`] and is
//! driven by [`run`](Registry::run), which multiplexes four loops:
//!
//! - inbound: drains the transport mailbox (frames and link events)
//! - gossip: flushes batched membership events to every peer
//! - heartbeat: proves liveness and sweeps silent peers
//! - reply: routes scatter-gather answers from local members
//!
//! Peer death is driven by silence, not by socket state. A dropped link
//! marks the peer suspect and gives it `relink_grace` to come back; a
//! relink triggers a fresh snapshot exchange instead of a `NodeDown`.
//! Silence past `failure_timeout` is always fatal. An identity declared
//! dead stays dead: only a restart with a fresh epoch rejoins.

use async_channel::{Receiver, Sender, TrySendError};
use bytes::Bytes;
use futures_timer::Delay;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::RegistryConfig;
use crate::directory::{Directory, DirectoryStats, SyncState};
use crate::error::{Error, Result};
use crate::fanout::{self, BroadcastReport};
use crate::gather::{PendingQueries, QueryHit, ReplyOut, ReplyToken};
use crate::member::{Delivery, MemberHandle};
use crate::message::{
    decode_envelope, encode_envelope, Admission, DecodeOutcome, EventAction, IngressLog,
    MembershipEvent, WireMessage, MAX_EVENT_BATCH, MAX_FRAME_TARGETS, MAX_GROUP_LEN,
    MAX_SNAPSHOT_ENTRIES,
};
use crate::node::NodeId;
use crate::outbox::EventOutbox;
use crate::tracker::{ClusterEvent, LinkAdmission, PeerStatus, Tracker, TrackerStats};
use crate::transport::{LinkEvent, Transport, TransportError, TransportEvent, TransportMailbox};

#[cfg(feature = "metrics")]
use crate::metrics;

/// Counters describing one registry node.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegistryStats {
    /// Members registered on this node.
    pub local_members: usize,
    /// Directory contents.
    pub directory: DirectoryStats,
    /// Cluster tracker state.
    pub cluster: TrackerStats,
    /// Scatter-gather queries still waiting for an answer.
    pub pending_queries: usize,
    /// Membership events dropped because the outbox was full.
    pub dropped_events: u64,
}

struct LocalEntry {
    mailbox: Sender<Delivery>,
    groups: HashSet<String>,
}

#[derive(Default)]
struct Locals {
    next_id: u64,
    entries: HashMap<u64, LocalEntry>,
}

/// Implicit-leave hook held weakly by [`LocalMember`].
trait Deregister: Send + Sync {
    fn deregister(&self, local_id: u64);
}

/// Owned registration of one local member.
///
/// Dropping it removes the member from every group it joined and closes
/// its mailbox, exactly as an explicit leave would. The handle obtained
/// through [`handle`](LocalMember::handle) is `Copy` and may be shared
/// freely; only this owning value controls the member's lifetime.
pub struct LocalMember {
    handle: MemberHandle,
    registry: Weak<dyn Deregister>,
}

impl LocalMember {
    /// The member's handle, valid until this value is dropped.
    pub fn handle(&self) -> MemberHandle {
        self.handle
    }
}

impl Drop for LocalMember {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.handle.local());
        }
    }
}

impl fmt::Debug for LocalMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalMember({})", self.handle)
    }
}

/// A group membership registry node.
///
/// Cheap to clone; all clones share one node. See the
/// [module docs](self) for the overall lifecycle.
pub struct Registry<T: Transport> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: Transport> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RegistryInner<T: Transport> {
    transport: T,

    local: NodeId,

    config: RegistryConfig,

    /// Replicated group membership.
    directory: Directory,

    /// Peer liveness and cluster event fan-out.
    tracker: Tracker,

    /// Batched membership events awaiting a gossip flush.
    outbox: EventOutbox,

    /// Replay and stale-epoch filter for inbound envelopes.
    ingress: IngressLog,

    /// In-flight scatter-gather queries this node originated.
    queries: PendingQueries,

    /// Members registered on this node.
    locals: RwLock<Locals>,

    /// Peers whose link dropped, with the time of the drop. Cleared on
    /// relink; swept against `relink_grace` by the heartbeat loop.
    suspects: Mutex<HashMap<NodeId, Instant>>,

    /// Answers produced by local members on their way to the origin.
    reply_tx: Sender<ReplyOut>,
    reply_rx: Receiver<ReplyOut>,

    /// Ordered stream of frames and link events from the transport.
    inbound: Receiver<TransportEvent>,

    /// Sequence source for membership events.
    event_seq: AtomicU64,

    /// Sequence source for outbound envelopes.
    wire_seq: AtomicU64,

    shutdown: AtomicBool,

    /// Closing the sender wakes every background loop.
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl<T: Transport> Registry<T> {
    /// Create a registry node on top of a transport.
    ///
    /// The `mailbox` must be the one returned when constructing the
    /// transport. Nothing is processed until [`run`](Self::run) is
    /// driven.
    pub fn new(transport: T, mailbox: TransportMailbox, config: RegistryConfig) -> Self {
        let local = transport.local_node();
        let (reply_tx, reply_rx) = async_channel::bounded(config.channel_capacity.max(1));
        // Closing the sender notifies all receivers.
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);

        let inner = Arc::new(RegistryInner {
            transport,
            local,
            directory: Directory::new(local, config.shard_count),
            tracker: Tracker::new(config.channel_capacity.max(1)),
            outbox: EventOutbox::new(config.max_pending_events),
            ingress: IngressLog::new(),
            queries: PendingQueries::new(),
            locals: RwLock::new(Locals::default()),
            suspects: Mutex::new(HashMap::new()),
            reply_tx,
            reply_rx,
            inbound: mailbox.events,
            event_seq: AtomicU64::new(0),
            wire_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            config,
        });

        Self { inner }
    }

    /// Identity of this node.
    pub fn local_node(&self) -> NodeId {
        self.inner.local
    }

    /// The configuration this node runs with.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register a new member on this node.
    ///
    /// Returns the owning [`LocalMember`] and the mailbox deliveries for
    /// it will arrive on. The member belongs to no group until it joins
    /// one.
    pub fn register(&self) -> Result<(LocalMember, Receiver<Delivery>)> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let (tx, rx) = async_channel::bounded(self.inner.config.mailbox_capacity.max(1));
        let id = {
            let mut locals = self.inner.locals.write();
            locals.next_id += 1;
            let id = locals.next_id;
            locals.entries.insert(
                id,
                LocalEntry {
                    mailbox: tx,
                    groups: HashSet::new(),
                },
            );
            id
        };
        let registry: Weak<dyn Deregister> = Arc::<RegistryInner<T>>::downgrade(&self.inner);
        let member = LocalMember {
            handle: MemberHandle::new(self.inner.local, id),
            registry,
        };
        tracing::debug!(member = %member.handle, "member registered");
        Ok((member, rx))
    }

    /// Add a local member to a group.
    ///
    /// Joining a group the member is already in is a no-op. The join is
    /// visible in local [`members`](Self::members) immediately and
    /// reaches peers with the next gossip flush.
    pub fn join(&self, group: &str, member: MemberHandle) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.inner.check_group(group)?;
        if member.owner() != self.inner.local {
            return Err(Error::NotLocal { member });
        }

        let mut locals = self.inner.locals.write();
        let Some(entry) = locals.entries.get_mut(&member.local()) else {
            return Err(Error::MemberClosed { member });
        };
        if !entry.groups.insert(group.to_string()) {
            return Ok(());
        }
        let seq = self.inner.next_event_seq();
        self.inner.directory.join_local(group, member, seq);
        self.inner.outbox.push(MembershipEvent {
            group: group.to_string(),
            member,
            seq,
            action: EventAction::Join,
        });
        drop(locals);

        tracing::debug!(member = %member, group, "member joined group");
        Ok(())
    }

    /// Remove a local member from a group.
    ///
    /// Leaving a group the member is not in is a no-op.
    pub fn leave(&self, group: &str, member: MemberHandle) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.inner.check_group(group)?;
        if member.owner() != self.inner.local {
            return Err(Error::NotLocal { member });
        }

        let mut locals = self.inner.locals.write();
        let Some(entry) = locals.entries.get_mut(&member.local()) else {
            return Err(Error::MemberClosed { member });
        };
        if !entry.groups.remove(group) {
            return Ok(());
        }
        self.inner.directory.leave_local(group, &member);
        let seq = self.inner.next_event_seq();
        self.inner.outbox.push(MembershipEvent {
            group: group.to_string(),
            member,
            seq,
            action: EventAction::Leave,
        });
        drop(locals);

        tracing::debug!(member = %member, group, "member left group");
        Ok(())
    }

    /// Point-in-time membership of a group across the cluster.
    ///
    /// The returned vector never changes after the call; concurrent joins
    /// and leaves affect only later calls. Members owned by peers that
    /// have not completed their snapshot exchange are not included.
    pub fn members(&self, group: &str) -> Vec<MemberHandle> {
        self.inner.directory.members(group)
    }

    /// Members of a group registered on this node.
    pub fn local_members(&self, group: &str) -> Vec<MemberHandle> {
        self.inner.directory.local_members(group)
    }

    /// Names of all known non-empty groups.
    pub fn groups(&self) -> Vec<String> {
        self.inner.directory.groups()
    }

    /// Broadcast a payload to every member of a group.
    ///
    /// Takes one membership snapshot and delivers to each member in it at
    /// most once: local members through their mailboxes, remote members
    /// batched into one frame per owner. `exclude` omits one member,
    /// normally the sender itself. Peers that cannot be reached are
    /// reported, not retried.
    pub async fn broadcast(
        &self,
        group: &str,
        payload: Bytes,
        exclude: Option<MemberHandle>,
    ) -> Result<BroadcastReport> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.inner.check_group(group)?;
        self.inner.check_payload(&payload)?;

        let snapshot = self.inner.directory.members(group);
        let plan = fanout::plan(snapshot, exclude, self.inner.local);
        let mut report = BroadcastReport::default();

        {
            let locals = self.inner.locals.read();
            for member in &plan.local {
                let Some(entry) = locals.entries.get(&member.local()) else {
                    continue;
                };
                match entry.mailbox.try_send(Delivery::Cast(payload.clone())) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(member = %member, "mailbox full, cast dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(member = %member, "mailbox closed, cast dropped");
                    }
                }
            }
        }

        // Peer sends run concurrently; a stuck peer delays only itself.
        let sends = plan.remote.into_iter().map(|(peer, targets)| {
            let payload = payload.clone();
            async move {
                let mut sent = 0usize;
                for chunk in targets.chunks(MAX_FRAME_TARGETS) {
                    let message = WireMessage::Cast {
                        targets: chunk.iter().copied().collect(),
                        payload: payload.clone(),
                    };
                    if let Err(err) = self.inner.send_message(&peer, &message).await {
                        tracing::warn!(peer = %peer, error = %err, "cast frame not sent");
                        return (peer, sent, false);
                    }
                    sent += chunk.len();
                }
                (peer, sent, true)
            }
        });
        for (peer, sent, reachable) in futures::future::join_all(sends).await {
            report.delivered += sent;
            if !reachable {
                report.unreachable.push(peer);
            }
        }

        #[cfg(feature = "metrics")]
        {
            metrics::record_broadcast();
            metrics::record_cast_fanout(report.delivered);
        }
        Ok(report)
    }

    /// Ask every member of a group and resolve with the first answer.
    ///
    /// The call is delivered to each member of one membership snapshot;
    /// members answer through their [`ReplyToken`]. The first hit wins
    /// and later answers are discarded. Members that miss, crash, or
    /// cannot be reached do not fail the query; only the deadline does.
    /// An empty group waits out the full timeout.
    pub async fn query(&self, group: &str, payload: Bytes, timeout: Duration) -> Result<QueryHit> {
        use futures::future::FutureExt;

        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        self.inner.check_group(group)?;
        self.inner.check_payload(&payload)?;
        #[cfg(feature = "metrics")]
        metrics::record_query();

        let snapshot = self.inner.directory.members(group);
        let plan = fanout::plan(snapshot, None, self.inner.local);
        let (query_id, hit_rx) = self.inner.queries.begin();
        // The deadline covers the scatter phase too.
        let deadline = Delay::new(timeout);

        {
            let locals = self.inner.locals.read();
            for member in &plan.local {
                let Some(entry) = locals.entries.get(&member.local()) else {
                    continue;
                };
                let token =
                    ReplyToken::new(query_id, self.inner.local, self.inner.reply_tx.clone());
                if entry
                    .mailbox
                    .try_send(Delivery::Call(token, payload.clone()))
                    .is_err()
                {
                    // An unreachable member is a silent miss.
                    tracing::debug!(member = %member, "call not delivered");
                }
            }
        }

        let scatters = plan.remote.into_iter().map(|(peer, targets)| {
            let payload = payload.clone();
            async move {
                for chunk in targets.chunks(MAX_FRAME_TARGETS) {
                    let message = WireMessage::Call {
                        targets: chunk.iter().copied().collect(),
                        query_id,
                        payload: payload.clone(),
                    };
                    if let Err(err) = self.inner.send_message(&peer, &message).await {
                        // An unreachable peer shrinks the race, not the
                        // deadline.
                        tracing::debug!(peer = %peer, error = %err, "call fan-out to peer failed");
                        break;
                    }
                }
            }
        });
        futures::future::join_all(scatters).await;

        let deadline = deadline.fuse();
        let hit_recv = hit_rx.recv().fuse();
        let shutdown_recv = self.inner.shutdown_rx.recv().fuse();
        futures::pin_mut!(deadline, hit_recv, shutdown_recv);

        let outcome = futures::select! {
            hit = hit_recv => hit.map_err(|_| Error::NotFound),
            _ = deadline => Err(Error::NotFound),
            _ = shutdown_recv => Err(Error::Shutdown),
        };
        self.inner.queries.expire(query_id);

        #[cfg(feature = "metrics")]
        match &outcome {
            Ok(_) => metrics::record_query_hit(),
            Err(_) => metrics::record_query_timeout(),
        }
        outcome
    }

    /// Subscribe to cluster membership events.
    ///
    /// Every `NodeUp` and `NodeDown` published after this call is
    /// delivered in order. When a `NodeDown` is observed, the dead node's
    /// directory entries are already purged.
    pub fn subscribe(&self) -> Receiver<ClusterEvent> {
        self.inner.tracker.subscribe()
    }

    /// Establish a link to a peer by address.
    ///
    /// Admission, snapshot exchange, and the `NodeUp` event follow
    /// asynchronously through the run loop.
    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeId> {
        if self.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let peer = self.inner.transport.connect(addr).await?;
        if self.inner.tracker.is_stale(&peer) {
            self.inner.transport.disconnect(&peer).await;
            return Err(Error::Transport(TransportError::HandshakeRejected {
                addr,
                reason: "peer identity was already declared dead".to_string(),
            }));
        }
        Ok(peer)
    }

    /// Connection status of a node identity.
    pub fn peer_status(&self, node: &NodeId) -> PeerStatus {
        self.inner.tracker.status(node)
    }

    /// Peers currently linked to this node.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.tracker.connected()
    }

    /// Directory synchronization state of a peer.
    pub fn sync_state(&self, peer: &NodeId) -> SyncState {
        self.inner.directory.sync_state(peer)
    }

    /// Counters describing this node.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            local_members: self.inner.locals.read().entries.len(),
            directory: self.inner.directory.stats(),
            cluster: self.inner.tracker.stats(),
            pending_queries: self.inner.queries.len(),
            dropped_events: self.inner.outbox.dropped(),
        }
    }

    /// Drive the registry until shutdown.
    ///
    /// Runs the inbound, gossip, heartbeat, and reply loops concurrently
    /// on the calling task. Spawn it once per node.
    pub async fn run(&self) {
        let inner = &self.inner;
        futures::join!(
            inner.inbound_loop(),
            inner.gossip_loop(),
            inner.heartbeat_loop(),
            inner.reply_loop(),
        );
        tracing::debug!(node = %inner.local, "registry loops stopped");
    }

    /// Shut the node down.
    ///
    /// Says goodbye to every peer so they purge this node immediately,
    /// stops the background loops, closes all member mailboxes, and
    /// shuts the transport down. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.inner.tracker.connected() {
            if let Err(err) = self.inner.send_message(&peer, &WireMessage::Bye).await {
                tracing::debug!(peer = %peer, error = %err, "goodbye not sent");
            }
        }
        self.inner.outbox.stop();
        self.inner.shutdown_tx.close();
        self.inner.reply_tx.close();
        self.inner.transport.shutdown().await;
        self.inner.locals.write().entries.clear();
        tracing::info!(node = %self.inner.local, "registry shut down");
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl<T: Transport> RegistryInner<T> {
    fn next_event_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_group(&self, group: &str) -> Result<()> {
        let max = self.config.max_group_len.min(MAX_GROUP_LEN);
        if group.len() > max {
            return Err(Error::GroupNameTooLong {
                len: group.len(),
                max,
            });
        }
        Ok(())
    }

    fn check_payload(&self, payload: &Bytes) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max_size: self.config.max_payload_size,
            });
        }
        Ok(())
    }

    /// Wrap a message in an envelope and hand it to the transport.
    async fn send_message(
        &self,
        target: &NodeId,
        message: &WireMessage,
    ) -> std::result::Result<(), TransportError> {
        let seq = self.wire_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = encode_envelope(&self.local, seq, message);
        self.transport.send_to(target, frame).await
    }

    /// Send this node's full directory contribution to a peer.
    async fn send_snapshot(&self, peer: &NodeId) {
        let chunk_size = self.config.snapshot_chunk_size.clamp(1, MAX_SNAPSHOT_ENTRIES);
        let mut remaining = self.directory.snapshot_local();
        let total = remaining.len();

        if remaining.is_empty() {
            let message = WireMessage::Snapshot {
                entries: Vec::new(),
                done: true,
            };
            if let Err(err) = self.send_message(peer, &message).await {
                tracing::warn!(peer = %peer, error = %err, "snapshot not sent");
            }
            return;
        }

        while !remaining.is_empty() {
            let take = remaining.len().min(chunk_size);
            let rest = remaining.split_off(take);
            let message = WireMessage::Snapshot {
                entries: remaining,
                done: rest.is_empty(),
            };
            if let Err(err) = self.send_message(peer, &message).await {
                // The peer stays Syncing; the next relink restarts the
                // exchange.
                tracing::warn!(peer = %peer, error = %err, "snapshot chunk not sent");
                return;
            }
            remaining = rest;
        }
        tracing::debug!(peer = %peer, entries = total, "snapshot sent");
        #[cfg(feature = "metrics")]
        metrics::record_snapshot_sent(total);
    }

    async fn handle_link_up(&self, peer: NodeId) {
        if peer == self.local {
            tracing::warn!("dropping link to self");
            self.transport.disconnect(&peer).await;
            return;
        }
        match self.tracker.link_up(peer) {
            LinkAdmission::Admitted { replaced } => {
                if let Some(old) = replaced {
                    self.drop_node(&old, "superseded by restarted peer").await;
                }
                self.suspects.lock().remove(&peer);
                self.directory.begin_sync(peer);
                self.tracker.publish(ClusterEvent::NodeUp(peer));
                tracing::info!(peer = %peer, "peer admitted");
                #[cfg(feature = "metrics")]
                {
                    metrics::record_node_up();
                    metrics::set_connected_peers(self.tracker.connected_count());
                }
                self.send_snapshot(&peer).await;
            }
            LinkAdmission::AlreadyConnected => {
                // A new physical link for a known identity: the old one
                // dropped somewhere. Re-run the snapshot exchange so
                // anything lost in between is reconciled.
                self.suspects.lock().remove(&peer);
                self.directory.begin_sync(peer);
                tracing::info!(peer = %peer, "peer relinked, resynchronizing");
                self.send_snapshot(&peer).await;
            }
            LinkAdmission::StaleEpoch => {
                tracing::debug!(peer = %peer, "refusing link from stale epoch");
                self.transport.disconnect(&peer).await;
            }
        }
    }

    fn handle_link_down(&self, peer: NodeId) {
        if self.tracker.status(&peer) != PeerStatus::Connected {
            return;
        }
        tracing::info!(peer = %peer, "link lost, awaiting relink");
        self.suspects.lock().entry(peer).or_insert_with(Instant::now);
    }

    async fn handle_frame(&self, from: NodeId, frame: Bytes) {
        let (sender, seq, message) = match decode_envelope(&frame) {
            DecodeOutcome::Ok {
                sender,
                seq,
                message,
            } => (sender, seq, message),
            DecodeOutcome::NotGroupcast => {
                tracing::debug!(from = %from, "ignoring foreign frame");
                return;
            }
            DecodeOutcome::IncompatibleVersion(version) => {
                tracing::warn!(from = %from, version, "frame from incompatible peer");
                return;
            }
            DecodeOutcome::Malformed => {
                tracing::warn!(from = %from, len = frame.len(), "malformed frame");
                #[cfg(feature = "metrics")]
                metrics::record_frame_rejected();
                return;
            }
        };

        if sender != from {
            tracing::warn!(from = %from, claimed = %sender, "frame sender mismatch");
            return;
        }

        self.tracker.heartbeat(&sender);
        match self.ingress.admit(&sender, seq) {
            Admission::Fresh => {}
            Admission::Duplicate => {
                tracing::debug!(sender = %sender, seq, "duplicate frame discarded");
                return;
            }
            Admission::StaleEpoch => {
                tracing::debug!(sender = %sender, seq, "stale epoch frame discarded");
                return;
            }
        }
        #[cfg(feature = "metrics")]
        metrics::record_frame_received();

        match message {
            WireMessage::Snapshot { entries, done } => {
                let applied = self.directory.apply_snapshot_chunk(&sender, entries, done);
                if done {
                    tracing::debug!(peer = %sender, applied, "peer snapshot complete");
                }
            }
            WireMessage::Events { events } => {
                for event in &events {
                    self.directory.apply_event(&sender, event);
                }
            }
            WireMessage::Cast { targets, payload } => {
                self.deliver_cast(&targets, &payload);
            }
            WireMessage::Call {
                targets,
                query_id,
                payload,
            } => {
                self.deliver_call(sender, query_id, &targets, &payload);
            }
            WireMessage::Reply {
                query_id,
                found,
                payload,
            } => {
                self.handle_reply(sender, query_id, found, payload);
            }
            WireMessage::Heartbeat => {}
            WireMessage::Bye => {
                self.drop_node(&sender, "peer said goodbye").await;
            }
        }
    }

    /// Hand a cast payload to the targeted local mailboxes.
    fn deliver_cast(&self, targets: &[MemberHandle], payload: &Bytes) {
        let locals = self.locals.read();
        for target in targets {
            if target.owner() != self.local {
                tracing::debug!(target = %target, "misrouted cast target");
                continue;
            }
            let Some(entry) = locals.entries.get(&target.local()) else {
                // The member left after the sender took its snapshot.
                tracing::debug!(target = %target, "cast for departed member");
                continue;
            };
            match entry.mailbox.try_send(Delivery::Cast(payload.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(target = %target, "mailbox full, cast dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(target = %target, "mailbox closed, cast dropped");
                }
            }
        }
    }

    /// Hand a call to the targeted local mailboxes with reply tokens
    /// routed back to the origin.
    fn deliver_call(&self, origin: NodeId, query_id: u64, targets: &[MemberHandle], payload: &Bytes) {
        let locals = self.locals.read();
        for target in targets {
            if target.owner() != self.local {
                tracing::debug!(target = %target, "misrouted call target");
                continue;
            }
            let Some(entry) = locals.entries.get(&target.local()) else {
                tracing::debug!(target = %target, "call for departed member");
                continue;
            };
            let token = ReplyToken::new(query_id, origin, self.reply_tx.clone());
            if entry
                .mailbox
                .try_send(Delivery::Call(token, payload.clone()))
                .is_err()
            {
                tracing::debug!(target = %target, "call not delivered");
            }
        }
    }

    /// Resolve a remote member's answer against this node's pending
    /// queries.
    fn handle_reply(&self, sender: NodeId, query_id: u64, found: bool, payload: Bytes) {
        if !found {
            tracing::debug!(sender = %sender, query_id, "miss reported");
            return;
        }
        let hit = QueryHit {
            responder: sender,
            payload,
        };
        if !self.queries.resolve(query_id, hit) {
            tracing::debug!(sender = %sender, query_id, "late answer discarded");
        }
    }

    /// Declare a node dead: purge its entries, then tell subscribers.
    async fn drop_node(&self, node: &NodeId, reason: &str) {
        if !self.tracker.link_down(node) {
            return;
        }
        self.suspects.lock().remove(node);
        let purged = self.directory.purge_node(node);
        self.ingress.forget(node);
        self.tracker.publish(ClusterEvent::NodeDown(*node));
        self.transport.disconnect(node).await;
        tracing::info!(node = %node, purged, reason, "node down");
        #[cfg(feature = "metrics")]
        {
            metrics::record_node_down();
            metrics::set_connected_peers(self.tracker.connected_count());
        }
    }

    /// Drain the transport mailbox until it closes or shutdown.
    async fn inbound_loop(&self) {
        use futures::future::FutureExt;

        loop {
            let event = {
                let next = self.inbound.recv().fuse();
                let shutdown_recv = self.shutdown_rx.recv().fuse();
                futures::pin_mut!(next, shutdown_recv);

                futures::select! {
                    event = next => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                    _ = shutdown_recv => break,
                }
            };
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match event {
                TransportEvent::Link(LinkEvent::Up(peer)) => self.handle_link_up(peer).await,
                TransportEvent::Link(LinkEvent::Down(peer)) => self.handle_link_down(peer),
                TransportEvent::Frame(from, frame) => self.handle_frame(from, frame).await,
            }
        }
    }

    /// Flush batched membership events to every connected peer.
    async fn gossip_loop(&self) {
        use futures::future::FutureExt;

        let mut interval = Delay::new(self.config.gossip_flush_interval);
        loop {
            {
                let shutdown_recv = self.shutdown_rx.recv().fuse();
                futures::pin_mut!(shutdown_recv);
                futures::select! {
                    _ = (&mut interval).fuse() => {
                        interval.reset(self.config.gossip_flush_interval);
                    }
                    _ = shutdown_recv => break,
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.flush_events().await;
        }
    }

    async fn flush_events(&self) {
        let batch_size = self.config.gossip_batch_size.clamp(1, MAX_EVENT_BATCH);
        loop {
            let batch = self.outbox.pop_batch(batch_size);
            if batch.is_empty() {
                return;
            }
            let peers = self.tracker.connected();
            if peers.is_empty() {
                // Nobody to tell; the state itself lives in the directory
                // and reaches future peers through their snapshot.
                continue;
            }
            let events: SmallVec<[MembershipEvent; 8]> = batch.into_iter().collect();
            let flushed = events.len();
            let message = WireMessage::Events { events };
            for peer in peers {
                if let Err(err) = self.send_message(&peer, &message).await {
                    tracing::debug!(peer = %peer, error = %err, "event batch not sent");
                }
            }
            #[cfg(feature = "metrics")]
            metrics::record_events_flushed(flushed);
            #[cfg(not(feature = "metrics"))]
            let _ = flushed;
        }
    }

    /// Prove liveness to peers and sweep the ones that went silent.
    async fn heartbeat_loop(&self) {
        use futures::future::FutureExt;

        let mut interval = Delay::new(self.config.heartbeat_interval);
        loop {
            {
                let shutdown_recv = self.shutdown_rx.recv().fuse();
                futures::pin_mut!(shutdown_recv);
                futures::select! {
                    _ = (&mut interval).fuse() => {
                        interval.reset(self.config.heartbeat_interval);
                    }
                    _ = shutdown_recv => break,
                }
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            for peer in self.tracker.connected() {
                if let Err(err) = self.send_message(&peer, &WireMessage::Heartbeat).await {
                    tracing::debug!(peer = %peer, error = %err, "heartbeat not sent");
                }
            }
            self.sweep_failures().await;
        }
    }

    async fn sweep_failures(&self) {
        let mut doomed: Vec<(NodeId, &'static str)> = self
            .tracker
            .expired(self.config.failure_timeout)
            .into_iter()
            .map(|node| (node, "failure timeout"))
            .collect();
        {
            let suspects = self.suspects.lock();
            for (node, since) in suspects.iter() {
                if since.elapsed() >= self.config.relink_grace
                    && !doomed.iter().any(|(doomed_node, _)| doomed_node == node)
                {
                    doomed.push((*node, "link lost"));
                }
            }
        }
        for (node, reason) in doomed {
            self.drop_node(&node, reason).await;
        }
    }

    /// Route answers from local members: resolve our own queries, ship
    /// the rest to their origin.
    async fn reply_loop(&self) {
        while let Ok(out) = self.reply_rx.recv().await {
            if out.origin == self.local {
                if out.found {
                    let hit = QueryHit {
                        responder: self.local,
                        payload: out.payload,
                    };
                    if !self.queries.resolve(out.query_id, hit) {
                        tracing::debug!(query_id = out.query_id, "late local answer discarded");
                    }
                } else {
                    tracing::debug!(query_id = out.query_id, "local miss");
                }
                continue;
            }
            let message = WireMessage::Reply {
                query_id: out.query_id,
                found: out.found,
                payload: out.payload,
            };
            if let Err(err) = self.send_message(&out.origin, &message).await {
                tracing::debug!(origin = %out.origin, error = %err, "reply not sent");
            }
        }
    }
}

impl<T: Transport> Deregister for RegistryInner<T> {
    /// Implicit leave: drop the member from every group it joined.
    fn deregister(&self, local_id: u64) {
        let groups = {
            let mut locals = self.locals.write();
            match locals.entries.remove(&local_id) {
                Some(entry) => entry.groups,
                None => return,
            }
        };
        if groups.is_empty() {
            return;
        }
        let member = MemberHandle::new(self.local, local_id);
        for group in groups {
            self.directory.leave_local(&group, &member);
            let seq = self.next_event_seq();
            self.outbox.push(MembershipEvent {
                group,
                member,
                seq,
                action: EventAction::Leave,
            });
        }
        tracing::debug!(member = %member, "member deregistered");
    }
}
