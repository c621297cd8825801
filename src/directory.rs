//! Sharded membership directory.
//!
//! The directory holds every known group entry: entries owned by local
//! members and entries replicated from peers. Groups are spread across a
//! fixed set of shards, each behind its own lock, so updates to different
//! groups rarely contend and every read of one group sees an atomic
//! point-in-time view of it.
//!
//! Remote state arrives per peer as one full snapshot followed by
//! incremental events. Every remote change carries a per-member sequence
//! number; a change is applied only when its sequence exceeds the highest
//! one already applied for the same member and group. Replayed frames and
//! snapshot overlap are therefore harmless, which matters because both
//! reach this module through independent paths.
//!
//! Lock order: when the peer table and a shard are both needed, the peer
//! table is always locked first. No path locks the peer table while
//! holding a shard.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::member::MemberHandle;
use crate::message::{EventAction, MemberEntry, MembershipEvent};
use crate::node::NodeId;

/// Synchronization state of one peer's directory contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No state exchanged with this peer.
    Unknown,
    /// Snapshot transfer in progress; entries are staged but not yet
    /// visible through [`Directory::members`].
    Syncing,
    /// Snapshot complete; incremental events keep the state current.
    Synced,
}

/// Counters describing the directory contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DirectoryStats {
    /// Number of non-empty groups.
    pub groups: usize,
    /// Total member entries across all groups.
    pub entries: usize,
    /// Peers whose snapshot has completed.
    pub synced_peers: usize,
    /// Peers still transferring their snapshot.
    pub syncing_peers: usize,
}

#[derive(Debug, Default)]
struct Shard {
    /// group name -> member -> sequence of the join that created the entry
    groups: HashMap<String, HashMap<MemberHandle, u64>>,
}

#[derive(Debug)]
struct PeerSync {
    state: SyncState,
    /// member local id -> group -> highest applied sequence
    applied: HashMap<u64, HashMap<String, u64>>,
    /// Entries confirmed live by the in-flight snapshot. `Some` while
    /// syncing; used at completion to drop entries the peer no longer has.
    pending_sync: Option<HashSet<(u64, String)>>,
}

/// The sharded membership directory of one registry node.
#[derive(Debug)]
pub struct Directory {
    local: NodeId,
    shards: Box<[RwLock<Shard>]>,
    peers: RwLock<HashMap<NodeId, PeerSync>>,
    shard_mask: usize,
}

impl Directory {
    /// Create an empty directory.
    ///
    /// `shard_count` is rounded up to the next power of two.
    pub fn new(local: NodeId, shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards = (0..count)
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            local,
            shards,
            peers: RwLock::new(HashMap::new()),
            shard_mask: count - 1,
        }
    }

    fn shard_for(&self, group: &str) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        group.hash(&mut hasher);
        &self.shards[hasher.finish() as usize & self.shard_mask]
    }

    /// Insert an entry for a local member.
    ///
    /// Returns false if the member was already in the group.
    pub fn join_local(&self, group: &str, member: MemberHandle, seq: u64) -> bool {
        let mut shard = self.shard_for(group).write();
        let entries = shard.groups.entry(group.to_string()).or_default();
        match entries.get_mut(&member) {
            Some(existing) => {
                *existing = (*existing).max(seq);
                false
            }
            None => {
                entries.insert(member, seq);
                true
            }
        }
    }

    /// Remove an entry for a local member.
    ///
    /// Returns false if the member was not in the group.
    pub fn leave_local(&self, group: &str, member: &MemberHandle) -> bool {
        let mut shard = self.shard_for(group).write();
        let Some(entries) = shard.groups.get_mut(group) else {
            return false;
        };
        let removed = entries.remove(member).is_some();
        if entries.is_empty() {
            shard.groups.remove(group);
        }
        removed
    }

    /// Start (or restart) a snapshot exchange with a peer.
    ///
    /// Existing entries and sequence marks from a previous link are kept;
    /// the snapshot completion pass reconciles entries the peer dropped
    /// while the link was down.
    pub fn begin_sync(&self, peer: NodeId) {
        let mut peers = self.peers.write();
        let sync = peers.entry(peer).or_insert_with(|| PeerSync {
            state: SyncState::Syncing,
            applied: HashMap::new(),
            pending_sync: None,
        });
        sync.state = SyncState::Syncing;
        sync.pending_sync = Some(HashSet::new());
    }

    /// Apply one snapshot chunk from a peer.
    ///
    /// Returns the number of entries actually inserted. When `done` is
    /// set, entries owned by the peer that the snapshot did not confirm
    /// are removed and the peer becomes [`SyncState::Synced`].
    pub fn apply_snapshot_chunk(
        &self,
        peer: &NodeId,
        entries: Vec<MemberEntry>,
        done: bool,
    ) -> usize {
        let mut applied = 0;
        for entry in entries {
            if entry.member.owner() != *peer {
                tracing::warn!(
                    peer = %peer,
                    owner = %entry.member.owner(),
                    "dropping snapshot entry not owned by its sender"
                );
                continue;
            }
            if self.apply_remote(peer, &entry.group, entry.member, entry.seq, EventAction::Join) {
                applied += 1;
            }
        }
        if done {
            self.finish_sync(peer);
        }
        applied
    }

    /// Apply one membership event from a peer.
    ///
    /// Returns false when the event is stale, spoofed, or from a peer that
    /// never started a sync.
    pub fn apply_event(&self, peer: &NodeId, event: &MembershipEvent) -> bool {
        if event.member.owner() != *peer {
            tracing::warn!(
                peer = %peer,
                owner = %event.member.owner(),
                "dropping event not owned by its sender"
            );
            return false;
        }
        self.apply_remote(peer, &event.group, event.member, event.seq, event.action)
    }

    fn apply_remote(
        &self,
        peer: &NodeId,
        group: &str,
        member: MemberHandle,
        seq: u64,
        action: EventAction,
    ) -> bool {
        let mut peers = self.peers.write();
        let Some(sync) = peers.get_mut(peer) else {
            tracing::debug!(peer = %peer, "dropping change from peer without sync state");
            return false;
        };

        // Track what the in-flight snapshot round confirms as live.
        if let Some(pending) = sync.pending_sync.as_mut() {
            match action {
                EventAction::Join => {
                    pending.insert((member.local(), group.to_string()));
                }
                EventAction::Leave => {
                    pending.remove(&(member.local(), group.to_string()));
                }
            }
        }

        let mark = sync
            .applied
            .entry(member.local())
            .or_default()
            .entry(group.to_string())
            .or_insert(0);
        if seq <= *mark {
            tracing::debug!(
                peer = %peer,
                member = %member,
                group,
                seq,
                mark = *mark,
                "discarding stale membership change"
            );
            return false;
        }
        *mark = seq;

        // Peer table stays locked so a concurrent purge cannot interleave
        // between the mark update and the shard write.
        let mut shard = self.shard_for(group).write();
        match action {
            EventAction::Join => {
                shard
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .insert(member, seq);
            }
            EventAction::Leave => {
                if let Some(entries) = shard.groups.get_mut(group) {
                    entries.remove(&member);
                    if entries.is_empty() {
                        shard.groups.remove(group);
                    }
                }
            }
        }
        true
    }

    fn finish_sync(&self, peer: &NodeId) {
        let mut peers = self.peers.write();
        let Some(sync) = peers.get_mut(peer) else {
            return;
        };
        let confirmed = sync.pending_sync.take().unwrap_or_default();
        sync.state = SyncState::Synced;

        // Drop entries the peer no longer carries. Covers leaves that
        // happened while no link existed.
        let mut removed = 0usize;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.groups.retain(|group, entries| {
                entries.retain(|member, _| {
                    if member.owner() != *peer {
                        return true;
                    }
                    let live = confirmed.contains(&(member.local(), group.clone()));
                    if !live {
                        removed += 1;
                    }
                    live
                });
                !entries.is_empty()
            });
        }
        if removed > 0 {
            tracing::debug!(peer = %peer, removed, "reconciled entries after snapshot");
        }
    }

    /// Remove every entry owned by a node along with its sync state.
    ///
    /// Each shard is swept under its write lock, so no reader of a group
    /// observes a partially purged group.
    pub fn purge_node(&self, node: &NodeId) -> usize {
        let mut peers = self.peers.write();
        peers.remove(node);

        let mut removed = 0usize;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.groups.retain(|_, entries| {
                let before = entries.len();
                entries.retain(|member, _| member.owner() != *node);
                removed += before - entries.len();
                !entries.is_empty()
            });
        }
        removed
    }

    /// Point-in-time membership of a group.
    ///
    /// Unions local entries with entries from peers whose snapshot has
    /// completed. The returned vector is a consistent view of the group at
    /// one instant; later changes never mutate it.
    pub fn members(&self, group: &str) -> Vec<MemberHandle> {
        let synced: HashSet<NodeId> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, sync)| sync.state == SyncState::Synced)
                .map(|(node, _)| *node)
                .collect()
        };

        let shard = self.shard_for(group).read();
        let Some(entries) = shard.groups.get(group) else {
            return Vec::new();
        };
        entries
            .keys()
            .filter(|member| member.owner() == self.local || synced.contains(&member.owner()))
            .copied()
            .collect()
    }

    /// Members of a group owned by the local node.
    pub fn local_members(&self, group: &str) -> Vec<MemberHandle> {
        let shard = self.shard_for(group).read();
        let Some(entries) = shard.groups.get(group) else {
            return Vec::new();
        };
        entries
            .keys()
            .filter(|member| member.owner() == self.local)
            .copied()
            .collect()
    }

    /// Names of all groups with at least one entry.
    pub fn groups(&self) -> Vec<String> {
        let mut names = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            names.extend(shard.groups.keys().cloned());
        }
        names
    }

    /// All entries owned by the local node, for snapshot frames.
    pub fn snapshot_local(&self) -> Vec<MemberEntry> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.read();
            for (group, entries) in &shard.groups {
                for (member, seq) in entries {
                    if member.owner() == self.local {
                        out.push(MemberEntry {
                            group: group.clone(),
                            member: *member,
                            seq: *seq,
                        });
                    }
                }
            }
        }
        out
    }

    /// Synchronization state of a peer.
    pub fn sync_state(&self, peer: &NodeId) -> SyncState {
        self.peers
            .read()
            .get(peer)
            .map(|sync| sync.state)
            .unwrap_or(SyncState::Unknown)
    }

    /// Counters describing the directory contents.
    pub fn stats(&self) -> DirectoryStats {
        let (synced_peers, syncing_peers) = {
            let peers = self.peers.read();
            let synced = peers
                .values()
                .filter(|sync| sync.state == SyncState::Synced)
                .count();
            (synced, peers.len() - synced)
        };

        let mut groups = 0;
        let mut entries = 0;
        for shard in self.shards.iter() {
            let shard = shard.read();
            groups += shard.groups.len();
            entries += shard.groups.values().map(HashMap::len).sum::<usize>();
        }
        DirectoryStats {
            groups,
            entries,
            synced_peers,
            syncing_peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        let addr = format!("127.0.0.1:{port}").parse().unwrap();
        NodeId::new(addr, 1)
    }

    fn entry(peer: NodeId, local: u64, group: &str, seq: u64) -> MemberEntry {
        MemberEntry {
            group: group.to_string(),
            member: MemberHandle::new(peer, local),
            seq,
        }
    }

    fn event(peer: NodeId, local: u64, group: &str, seq: u64, action: EventAction) -> MembershipEvent {
        MembershipEvent {
            group: group.to_string(),
            member: MemberHandle::new(peer, local),
            seq,
            action,
        }
    }

    fn synced_peer(dir: &Directory, peer: NodeId) {
        dir.begin_sync(peer);
        dir.apply_snapshot_chunk(&peer, vec![], true);
    }

    #[test]
    fn test_local_join_idempotent() {
        let local = node(9000);
        let dir = Directory::new(local, 4);
        let member = MemberHandle::new(local, 1);

        assert!(dir.join_local("workers", member, 1));
        assert!(!dir.join_local("workers", member, 2));
        assert_eq!(dir.members("workers"), vec![member]);
    }

    #[test]
    fn test_local_leave() {
        let local = node(9000);
        let dir = Directory::new(local, 4);
        let member = MemberHandle::new(local, 1);

        dir.join_local("workers", member, 1);
        assert!(dir.leave_local("workers", &member));
        assert!(!dir.leave_local("workers", &member));
        assert!(dir.members("workers").is_empty());
        assert!(dir.groups().is_empty());
    }

    #[test]
    fn test_event_requires_sync_state() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);
        let ev = event(peer, 1, "workers", 1, EventAction::Join);
        assert!(!dir.apply_event(&peer, &ev));

        dir.begin_sync(peer);
        assert!(dir.apply_event(&peer, &ev));
    }

    #[test]
    fn test_event_replay_discarded() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);
        synced_peer(&dir, peer);

        let ev = event(peer, 1, "workers", 3, EventAction::Join);
        assert!(dir.apply_event(&peer, &ev));
        assert!(!dir.apply_event(&peer, &ev), "replay must be discarded");
        assert_eq!(dir.members("workers").len(), 1);
    }

    #[test]
    fn test_stale_join_cannot_resurrect_after_leave() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);
        synced_peer(&dir, peer);

        assert!(dir.apply_event(&peer, &event(peer, 1, "workers", 1, EventAction::Join)));
        assert!(dir.apply_event(&peer, &event(peer, 1, "workers", 2, EventAction::Leave)));
        // A replayed join with the old sequence must not bring the entry back.
        assert!(!dir.apply_event(&peer, &event(peer, 1, "workers", 1, EventAction::Join)));
        assert!(dir.members("workers").is_empty());
    }

    #[test]
    fn test_spoofed_owner_rejected() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);
        let other = node(9002);
        synced_peer(&dir, peer);

        let ev = event(other, 1, "workers", 1, EventAction::Join);
        assert!(!dir.apply_event(&peer, &ev));
        assert!(dir.members("workers").is_empty());
    }

    #[test]
    fn test_syncing_entries_hidden_until_done() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);

        dir.begin_sync(peer);
        dir.apply_snapshot_chunk(&peer, vec![entry(peer, 1, "workers", 1)], false);
        assert_eq!(dir.sync_state(&peer), SyncState::Syncing);
        assert!(
            dir.members("workers").is_empty(),
            "entries stay hidden until the snapshot completes"
        );

        dir.apply_snapshot_chunk(&peer, vec![entry(peer, 2, "workers", 1)], true);
        assert_eq!(dir.sync_state(&peer), SyncState::Synced);
        assert_eq!(dir.members("workers").len(), 2);
    }

    #[test]
    fn test_resync_reconciles_dropped_entries() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);

        dir.begin_sync(peer);
        dir.apply_snapshot_chunk(
            &peer,
            vec![entry(peer, 1, "workers", 1), entry(peer, 2, "workers", 1)],
            true,
        );
        assert_eq!(dir.members("workers").len(), 2);

        // The link flapped; the peer dropped member 2 while unlinked. The
        // new snapshot only confirms member 1.
        dir.begin_sync(peer);
        dir.apply_snapshot_chunk(&peer, vec![entry(peer, 1, "workers", 1)], true);

        let members = dir.members("workers");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].local(), 1);
    }

    #[test]
    fn test_event_during_sync_survives_reconcile() {
        let dir = Directory::new(node(9000), 4);
        let peer = node(9001);

        dir.begin_sync(peer);
        dir.apply_snapshot_chunk(&peer, vec![entry(peer, 1, "workers", 1)], false);
        // A join newer than the snapshot arrives before the final chunk.
        assert!(dir.apply_event(&peer, &event(peer, 2, "workers", 1, EventAction::Join)));
        dir.apply_snapshot_chunk(&peer, vec![], true);

        assert_eq!(dir.members("workers").len(), 2);
    }

    #[test]
    fn test_purge_removes_all_entries_atomically() {
        let local = node(9000);
        let dir = Directory::new(local, 4);
        let peer = node(9001);
        let mine = MemberHandle::new(local, 1);

        dir.join_local("workers", mine, 1);
        synced_peer(&dir, peer);
        for (id, group) in [(1, "workers"), (2, "metrics"), (3, "workers")] {
            assert!(dir.apply_event(&peer, &event(peer, id, group, 1, EventAction::Join)));
        }

        let removed = dir.purge_node(&peer);
        assert_eq!(removed, 3);
        assert_eq!(dir.sync_state(&peer), SyncState::Unknown);
        assert_eq!(dir.members("workers"), vec![mine]);
        assert!(dir.members("metrics").is_empty());

        // Late events from the purged node are dropped until a new sync.
        assert!(!dir.apply_event(&peer, &event(peer, 4, "workers", 2, EventAction::Join)));
    }

    #[test]
    fn test_snapshot_local_own_entries_only() {
        let local = node(9000);
        let dir = Directory::new(local, 4);
        let peer = node(9001);

        dir.join_local("workers", MemberHandle::new(local, 1), 1);
        dir.join_local("metrics", MemberHandle::new(local, 2), 2);
        synced_peer(&dir, peer);
        dir.apply_event(&peer, &event(peer, 1, "workers", 1, EventAction::Join));

        let snapshot = dir.snapshot_local();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|e| e.member.owner() == local));
    }

    #[test]
    fn test_stats() {
        let local = node(9000);
        let dir = Directory::new(local, 4);
        let peer = node(9001);

        dir.join_local("workers", MemberHandle::new(local, 1), 1);
        dir.begin_sync(peer);

        let stats = dir.stats();
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.syncing_peers, 1);
        assert_eq!(stats.synced_peers, 0);
    }
}
