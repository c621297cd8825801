//! Registry wire message types.
//!
//! # Zero-Copy Payload Handling
//!
//! Messages use [`Bytes`] for payload storage, which provides zero-copy
//! semantics through reference counting:
//!
//! - **`Bytes::clone()`** is O(1) - only increments a reference count
//! - **Slicing** creates a new view without copying data
//! - **Fanning a broadcast out** reuses the same underlying buffer
//!
//! This means broadcasting one payload to many peers only allocates the
//! envelope headers; the payload bytes are shared across all frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::member::MemberHandle;

/// Maximum group name length accepted on the wire, in bytes.
pub const MAX_GROUP_LEN: usize = 256;

/// Maximum number of directory entries in a single snapshot frame.
pub const MAX_SNAPSHOT_ENTRIES: usize = 4096;

/// Maximum number of membership events in a single frame.
pub const MAX_EVENT_BATCH: usize = 64;

/// Maximum number of delivery targets in a single cast or call frame.
pub const MAX_FRAME_TARGETS: usize = 1024;

/// Membership change actions carried by event frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// The member joined the group.
    Join = 1,
    /// The member left the group.
    Leave = 2,
}

impl TryFrom<u8> for EventAction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventAction::Join),
            2 => Ok(EventAction::Leave),
            _ => Err(value),
        }
    }
}

/// One directory entry carried by a snapshot frame.
///
/// Snapshots only carry entries owned by the sending node, so
/// `member.owner()` always matches the envelope sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    /// Group the member belongs to.
    pub group: String,
    /// The member handle.
    pub member: MemberHandle,
    /// Sequence number of the join that created this entry.
    pub seq: u64,
}

impl MemberEntry {
    /// Encode the entry into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        put_group(buf, &self.group);
        self.member.encode(buf);
        buf.put_u64(self.seq);
    }

    /// Calculate the encoded length of the entry.
    pub fn encoded_len(&self) -> usize {
        2 + self.group.len() + self.member.encoded_len() + 8
    }

    /// Decode an entry from bytes.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let group = get_group(buf)?;
        let member = MemberHandle::decode(buf)?;
        if buf.remaining() < 8 {
            return None;
        }
        let seq = buf.get_u64();
        Some(Self { group, member, seq })
    }
}

/// A single membership change, ordered per member by `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    /// Group affected by the change.
    pub group: String,
    /// The member that joined or left.
    pub member: MemberHandle,
    /// Per-member sequence number. Receivers apply an event only when its
    /// sequence exceeds the highest one applied for the same member and
    /// group, which makes replays and snapshot overlap harmless.
    pub seq: u64,
    /// Whether the member joined or left.
    pub action: EventAction,
}

impl MembershipEvent {
    /// Encode the event into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        put_group(buf, &self.group);
        self.member.encode(buf);
        buf.put_u64(self.seq);
        buf.put_u8(self.action as u8);
    }

    /// Calculate the encoded length of the event.
    pub fn encoded_len(&self) -> usize {
        2 + self.group.len() + self.member.encoded_len() + 8 + 1
    }

    /// Decode an event from bytes.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let group = get_group(buf)?;
        let member = MemberHandle::decode(buf)?;
        if buf.remaining() < 9 {
            return None;
        }
        let seq = buf.get_u64();
        let action = EventAction::try_from(buf.get_u8()).ok()?;
        Some(Self {
            group,
            member,
            seq,
            action,
        })
    }
}

/// Protocol messages exchanged between registry nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Full dump of the sender's own directory entries.
    ///
    /// Sent when a link comes up, split into chunks. The receiver treats
    /// the peer as syncing until the chunk marked `done` arrives.
    Snapshot {
        /// Directory entries owned by the sender.
        entries: Vec<MemberEntry>,
        /// True on the final chunk of the snapshot.
        done: bool,
    },

    /// Batched incremental membership changes.
    Events {
        /// Events in the order the sender produced them.
        events: SmallVec<[MembershipEvent; 8]>,
    },

    /// One-way broadcast payload for members owned by the receiver.
    ///
    /// The target list was fixed from a single membership snapshot at the
    /// origin; the receiver delivers to exactly these mailboxes and never
    /// re-evaluates membership.
    Cast {
        /// Members on the receiving node to deliver to.
        targets: SmallVec<[MemberHandle; 8]>,
        /// Message payload.
        payload: Bytes,
    },

    /// Scatter-gather request for members owned by the receiver.
    Call {
        /// Members on the receiving node to ask.
        targets: SmallVec<[MemberHandle; 8]>,
        /// Identifier correlating replies with the pending query.
        query_id: u64,
        /// Request payload.
        payload: Bytes,
    },

    /// Answer to a `Call`.
    Reply {
        /// Identifier of the query being answered.
        query_id: u64,
        /// True for a hit; misses are recorded but never resolve a query.
        found: bool,
        /// Response payload (empty for misses).
        payload: Bytes,
    },

    /// Liveness probe. Any frame refreshes the failure detector; this one
    /// exists so idle links still carry proof of life.
    Heartbeat,

    /// Graceful departure announcement. The receiver purges the sender
    /// immediately instead of waiting for the failure timeout.
    Bye,
}

/// Message type tags for encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    /// Snapshot message tag.
    Snapshot = 1,
    /// Events message tag.
    Events = 2,
    /// Cast message tag.
    Cast = 3,
    /// Call message tag.
    Call = 4,
    /// Reply message tag.
    Reply = 5,
    /// Heartbeat message tag.
    Heartbeat = 6,
    /// Bye message tag.
    Bye = 7,
}

impl TryFrom<u8> for MessageTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageTag::Snapshot),
            2 => Ok(MessageTag::Events),
            3 => Ok(MessageTag::Cast),
            4 => Ok(MessageTag::Call),
            5 => Ok(MessageTag::Reply),
            6 => Ok(MessageTag::Heartbeat),
            7 => Ok(MessageTag::Bye),
            _ => Err(value),
        }
    }
}

impl WireMessage {
    /// Encode the message into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            WireMessage::Snapshot { entries, done } => {
                buf.put_u8(MessageTag::Snapshot as u8);
                buf.put_u8(if *done { 1 } else { 0 });
                buf.put_u16(entries.len() as u16);
                for entry in entries {
                    entry.encode(buf);
                }
            }
            WireMessage::Events { events } => {
                buf.put_u8(MessageTag::Events as u8);
                buf.put_u16(events.len() as u16);
                for event in events {
                    event.encode(buf);
                }
            }
            WireMessage::Cast { targets, payload } => {
                buf.put_u8(MessageTag::Cast as u8);
                buf.put_u16(targets.len() as u16);
                for target in targets {
                    target.encode(buf);
                }
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            WireMessage::Call {
                targets,
                query_id,
                payload,
            } => {
                buf.put_u8(MessageTag::Call as u8);
                buf.put_u64(*query_id);
                buf.put_u16(targets.len() as u16);
                for target in targets {
                    target.encode(buf);
                }
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            WireMessage::Reply {
                query_id,
                found,
                payload,
            } => {
                buf.put_u8(MessageTag::Reply as u8);
                buf.put_u64(*query_id);
                buf.put_u8(if *found { 1 } else { 0 });
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            WireMessage::Heartbeat => {
                buf.put_u8(MessageTag::Heartbeat as u8);
            }
            WireMessage::Bye => {
                buf.put_u8(MessageTag::Bye as u8);
            }
        }
    }

    /// Encode the message into a new Bytes buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Calculate the encoded length of the message.
    pub fn encoded_len(&self) -> usize {
        match self {
            WireMessage::Snapshot { entries, .. } => {
                1 + 1 + 2 + entries.iter().map(MemberEntry::encoded_len).sum::<usize>()
            }
            WireMessage::Events { events } => {
                1 + 2 + events.iter().map(MembershipEvent::encoded_len).sum::<usize>()
            }
            WireMessage::Cast { targets, payload } => {
                1 + 2
                    + targets.iter().map(MemberHandle::encoded_len).sum::<usize>()
                    + 4
                    + payload.len()
            }
            WireMessage::Call {
                targets, payload, ..
            } => {
                1 + 8
                    + 2
                    + targets.iter().map(MemberHandle::encoded_len).sum::<usize>()
                    + 4
                    + payload.len()
            }
            WireMessage::Reply { payload, .. } => 1 + 8 + 1 + 4 + payload.len(),
            WireMessage::Heartbeat => 1,
            WireMessage::Bye => 1,
        }
    }

    /// Decode a message from bytes.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }

        let tag = MessageTag::try_from(buf.get_u8()).ok()?;

        match tag {
            MessageTag::Snapshot => {
                if buf.remaining() < 3 {
                    return None;
                }
                let done = buf.get_u8() != 0;
                let count = buf.get_u16() as usize;
                if count > MAX_SNAPSHOT_ENTRIES {
                    return None;
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(MemberEntry::decode(buf)?);
                }
                Some(WireMessage::Snapshot { entries, done })
            }
            MessageTag::Events => {
                if buf.remaining() < 2 {
                    return None;
                }
                let count = buf.get_u16() as usize;
                if count > MAX_EVENT_BATCH {
                    return None;
                }
                let mut events = SmallVec::with_capacity(count);
                for _ in 0..count {
                    events.push(MembershipEvent::decode(buf)?);
                }
                Some(WireMessage::Events { events })
            }
            MessageTag::Cast => {
                if buf.remaining() < 2 {
                    return None;
                }
                let count = buf.get_u16() as usize;
                if count > MAX_FRAME_TARGETS {
                    return None;
                }
                let mut targets = SmallVec::with_capacity(count);
                for _ in 0..count {
                    targets.push(MemberHandle::decode(buf)?);
                }
                if buf.remaining() < 4 {
                    return None;
                }
                let payload_len = buf.get_u32() as usize;
                if buf.remaining() < payload_len {
                    return None;
                }
                let payload = buf.copy_to_bytes(payload_len);
                Some(WireMessage::Cast { targets, payload })
            }
            MessageTag::Call => {
                if buf.remaining() < 10 {
                    return None;
                }
                let query_id = buf.get_u64();
                let count = buf.get_u16() as usize;
                if count > MAX_FRAME_TARGETS {
                    return None;
                }
                let mut targets = SmallVec::with_capacity(count);
                for _ in 0..count {
                    targets.push(MemberHandle::decode(buf)?);
                }
                if buf.remaining() < 4 {
                    return None;
                }
                let payload_len = buf.get_u32() as usize;
                if buf.remaining() < payload_len {
                    return None;
                }
                let payload = buf.copy_to_bytes(payload_len);
                Some(WireMessage::Call {
                    targets,
                    query_id,
                    payload,
                })
            }
            MessageTag::Reply => {
                if buf.remaining() < 8 + 1 + 4 {
                    return None;
                }
                let query_id = buf.get_u64();
                let found = buf.get_u8() != 0;
                let payload_len = buf.get_u32() as usize;
                if buf.remaining() < payload_len {
                    return None;
                }
                let payload = buf.copy_to_bytes(payload_len);
                Some(WireMessage::Reply {
                    query_id,
                    found,
                    payload,
                })
            }
            MessageTag::Heartbeat => Some(WireMessage::Heartbeat),
            MessageTag::Bye => Some(WireMessage::Bye),
        }
    }

    /// Decode a message from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut cursor = std::io::Cursor::new(data);
        Self::decode(&mut cursor)
    }

    /// Check if this is a Snapshot message.
    pub const fn is_snapshot(&self) -> bool {
        matches!(self, WireMessage::Snapshot { .. })
    }

    /// Check if this is an Events message.
    pub const fn is_events(&self) -> bool {
        matches!(self, WireMessage::Events { .. })
    }

    /// Check if this is a Cast message.
    pub const fn is_cast(&self) -> bool {
        matches!(self, WireMessage::Cast { .. })
    }

    /// Check if this is a Call message.
    pub const fn is_call(&self) -> bool {
        matches!(self, WireMessage::Call { .. })
    }

    /// Check if this is a Reply message.
    pub const fn is_reply(&self) -> bool {
        matches!(self, WireMessage::Reply { .. })
    }

    /// Check if this is a Heartbeat message.
    pub const fn is_heartbeat(&self) -> bool {
        matches!(self, WireMessage::Heartbeat)
    }

    /// Check if this is a Bye message.
    pub const fn is_bye(&self) -> bool {
        matches!(self, WireMessage::Bye)
    }

    /// Get the message tag.
    pub const fn tag(&self) -> MessageTag {
        match self {
            WireMessage::Snapshot { .. } => MessageTag::Snapshot,
            WireMessage::Events { .. } => MessageTag::Events,
            WireMessage::Cast { .. } => MessageTag::Cast,
            WireMessage::Call { .. } => MessageTag::Call,
            WireMessage::Reply { .. } => MessageTag::Reply,
            WireMessage::Heartbeat => MessageTag::Heartbeat,
            WireMessage::Bye => MessageTag::Bye,
        }
    }

    /// Get a human-readable type name for tracing/logging.
    pub const fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Snapshot { .. } => "Snapshot",
            WireMessage::Events { .. } => "Events",
            WireMessage::Cast { .. } => "Cast",
            WireMessage::Call { .. } => "Call",
            WireMessage::Reply { .. } => "Reply",
            WireMessage::Heartbeat => "Heartbeat",
            WireMessage::Bye => "Bye",
        }
    }
}

/// Encode a group name with a length prefix.
fn put_group(buf: &mut impl BufMut, group: &str) {
    buf.put_u16(group.len() as u16);
    buf.put_slice(group.as_bytes());
}

/// Decode a length-prefixed group name.
///
/// Returns `None` when the length exceeds [`MAX_GROUP_LEN`] or the bytes
/// are not valid UTF-8.
fn get_group(buf: &mut impl Buf) -> Option<String> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_u16() as usize;
    if len > MAX_GROUP_LEN || buf.remaining() < len {
        return None;
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).ok()
}
