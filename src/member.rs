//! Member handles and mailbox deliveries.

use crate::gather::ReplyToken;
use crate::node::NodeId;
use bytes::{Buf, BufMut, Bytes};
use std::fmt::{self, Debug, Display};

/// Opaque handle to a registered group member.
///
/// A handle pairs the identity of the owning node with an identifier that is
/// unique on that node for its lifetime. Handles are cheap to copy and
/// compare; delivery is only possible through the registry that issued them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberHandle {
    owner: NodeId,
    local: u64,
}

impl MemberHandle {
    /// Create a handle from its parts.
    pub const fn new(owner: NodeId, local: u64) -> Self {
        Self { owner, local }
    }

    /// Node that owns this member.
    #[inline]
    pub const fn owner(&self) -> NodeId {
        self.owner
    }

    /// Node-local identifier of this member.
    #[inline]
    pub const fn local(&self) -> u64 {
        self.local
    }

    /// Encode the handle into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        self.owner.encode(buf);
        buf.put_u64(self.local);
    }

    /// Calculate the encoded length of this handle.
    pub const fn encoded_len(&self) -> usize {
        self.owner.encoded_len() + 8
    }

    /// Decode a handle from bytes.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let owner = NodeId::decode(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        let local = buf.get_u64();
        Some(Self { owner, local })
    }
}

impl Debug for MemberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberHandle({}#{})", self.owner, self.local)
    }
}

impl Display for MemberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.local)
    }
}

/// A message delivered to a member's mailbox.
#[derive(Debug)]
pub enum Delivery {
    /// One-way broadcast payload.
    Cast(Bytes),
    /// Scatter-gather request. Answer through the token with
    /// [`ReplyToken::hit`] or [`ReplyToken::miss`]; dropping the token
    /// without answering counts as a miss.
    Call(ReplyToken, Bytes),
}

impl Delivery {
    /// Returns true if this is a one-way broadcast payload.
    pub const fn is_cast(&self) -> bool {
        matches!(self, Delivery::Cast(_))
    }

    /// Returns true if this is a scatter-gather request.
    pub const fn is_call(&self) -> bool {
        matches!(self, Delivery::Call(_, _))
    }

    /// The payload carried by this delivery.
    pub fn payload(&self) -> &Bytes {
        match self {
            Delivery::Cast(payload) => payload,
            Delivery::Call(_, payload) => payload,
        }
    }
}
