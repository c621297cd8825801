//! Fan-out planning for group broadcasts.
//!
//! A broadcast takes one membership snapshot and splits it into a local
//! delivery list plus one batch per remote owner. Each member lands in
//! exactly one batch, so a single send per batch delivers at most once
//! per member, and each peer receives one frame regardless of how many
//! of its members are targeted.

use smallvec::SmallVec;
use std::collections::HashMap;

use crate::member::MemberHandle;
use crate::node::NodeId;

/// Member batch carried by a single frame.
pub type TargetBatch = SmallVec<[MemberHandle; 8]>;

/// The delivery plan for one broadcast.
#[derive(Debug, Default)]
pub struct FanoutPlan {
    /// Members owned by this node, delivered straight to mailboxes.
    pub local: Vec<MemberHandle>,
    /// Remote members grouped by owning node.
    pub remote: HashMap<NodeId, TargetBatch>,
}

impl FanoutPlan {
    /// Total number of members the plan targets.
    pub fn target_count(&self) -> usize {
        self.local.len() + self.remote.values().map(|batch| batch.len()).sum::<usize>()
    }

    /// True when the plan targets nobody.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }
}

/// Split a membership snapshot into per-owner delivery batches.
///
/// `exclude` drops one member (normally the sender) from the plan.
/// Members that join after the snapshot was taken are absent by
/// construction; members that left keep their slot and fail softly at
/// delivery time.
pub fn plan(
    members: Vec<MemberHandle>,
    exclude: Option<MemberHandle>,
    local: NodeId,
) -> FanoutPlan {
    let mut out = FanoutPlan::default();
    for member in members {
        if exclude == Some(member) {
            continue;
        }
        if member.owner() == local {
            out.local.push(member);
        } else {
            out.remote.entry(member.owner()).or_default().push(member);
        }
    }
    out
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    /// Members the payload was handed off for, locally or in a peer frame.
    pub delivered: usize,
    /// Peers whose frame could not be sent; their members were skipped.
    pub unreachable: Vec<NodeId>,
}

impl BroadcastReport {
    /// True when every targeted member was handed off.
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }
}
