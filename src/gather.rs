//! Scatter-gather query plumbing.
//!
//! A query fans a call out to every member of a group and resolves with
//! the first hit. [`PendingQueries`] tracks in-flight queries on the
//! origin node; a [`ReplyToken`] travels with each delivered call and
//! routes the member's answer back, whether the member lives on the
//! origin node or on a peer.

use async_channel::Sender;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::node::NodeId;

/// One member's answer on its way back to the query origin.
///
/// Misses flow through the same path as hits so the origin can log
/// them; they never resolve a query.
#[derive(Debug, Clone)]
pub(crate) struct ReplyOut {
    pub query_id: u64,
    pub origin: NodeId,
    pub found: bool,
    pub payload: Bytes,
}

/// Capability to answer one received call.
///
/// The token is consumed by [`hit`](ReplyToken::hit) or
/// [`miss`](ReplyToken::miss). Dropping it unanswered is a silent miss:
/// the origin keeps waiting for other members until its deadline.
#[derive(Debug)]
pub struct ReplyToken {
    query_id: u64,
    origin: NodeId,
    tx: Sender<ReplyOut>,
}

impl ReplyToken {
    pub(crate) fn new(query_id: u64, origin: NodeId, tx: Sender<ReplyOut>) -> Self {
        Self {
            query_id,
            origin,
            tx,
        }
    }

    /// Identifier of the query this token answers.
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Node that issued the query.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Answer with a payload. The first hit to reach the origin wins.
    pub fn hit(self, payload: Bytes) {
        let out = ReplyOut {
            query_id: self.query_id,
            origin: self.origin,
            found: true,
            payload,
        };
        if self.tx.try_send(out).is_err() {
            tracing::debug!(query_id = self.query_id, "reply channel unavailable, hit dropped");
        }
    }

    /// Decline to answer. Misses are informational; the query keeps
    /// waiting for other members.
    pub fn miss(self) {
        let out = ReplyOut {
            query_id: self.query_id,
            origin: self.origin,
            found: false,
            payload: Bytes::new(),
        };
        let _ = self.tx.try_send(out);
    }
}

/// The first successful answer to a query.
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// Member owner that produced the answer.
    pub responder: NodeId,
    /// The answer payload.
    pub payload: Bytes,
}

/// In-flight queries on the origin node.
///
/// Each query gets a capacity-one channel. Resolution removes the entry
/// under the lock, so exactly one hit wins no matter how many arrive
/// concurrently.
#[derive(Debug, Default)]
pub(crate) struct PendingQueries {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Sender<QueryHit>>>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new query and hand back its id and hit receiver.
    pub fn begin(&self) -> (u64, async_channel::Receiver<QueryHit>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = async_channel::bounded(1);
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a hit. Returns false when the query already resolved,
    /// expired, or never existed.
    pub fn resolve(&self, query_id: u64, hit: QueryHit) -> bool {
        let tx = self.pending.lock().remove(&query_id);
        match tx {
            Some(tx) => tx.try_send(hit).is_ok(),
            None => false,
        }
    }

    /// Drop a query that reached its deadline. Late hits for it are
    /// discarded by [`resolve`](Self::resolve).
    pub fn expire(&self, query_id: u64) {
        self.pending.lock().remove(&query_id);
    }

    /// Number of queries still waiting.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
