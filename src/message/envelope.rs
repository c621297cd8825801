//! Frame envelope and ingress admission.
//!
//! Every frame on the wire is wrapped in an envelope carrying the sender's
//! identity and a per-sender sequence number:
//!
//! ```text
//! [MAGIC "GRP" (3)] [VERSION (1)] [sender NodeId] [seq u64] [message]
//! ```
//!
//! The sequence number is minted from one counter per sending node, so a
//! receiver can discard replayed frames. Senders number frames from several
//! concurrent tasks, so a receiver tolerates small reordering: it keeps a
//! sliding window of recently seen sequences per sender instead of a single
//! high-water mark. The sender's epoch gates frames from restarted
//! processes: once a higher epoch has been observed at an address, frames
//! from older epochs are silently dropped.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::message::WireMessage;
use crate::node::NodeId;

/// Magic bytes identifying registry frames.
pub const GROUPCAST_MAGIC: &[u8] = b"GRP";

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Minimum size of a valid envelope: magic, version, the smallest node ID
/// encoding, sequence number, and a one-byte message.
pub const MIN_ENVELOPE_SIZE: usize = 3 + 1 + 15 + 8 + 1;

/// Result of decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Frame decoded successfully.
    Ok {
        /// Node that sent the frame.
        sender: NodeId,
        /// Per-sender envelope sequence number.
        seq: u64,
        /// The decoded message.
        message: WireMessage,
    },
    /// The frame does not carry the registry magic.
    NotGroupcast,
    /// The frame carries the magic but an unsupported version.
    IncompatibleVersion(u8),
    /// The frame carries the magic and version but failed to decode.
    Malformed,
}

/// Encode a message into a framed envelope.
pub fn encode_envelope(sender: &NodeId, seq: u64, message: &WireMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(envelope_encoded_len(sender, message));
    buf.put_slice(GROUPCAST_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    sender.encode(&mut buf);
    buf.put_u64(seq);
    message.encode(&mut buf);
    buf.freeze()
}

/// Calculate the encoded length of an envelope.
pub fn envelope_encoded_len(sender: &NodeId, message: &WireMessage) -> usize {
    GROUPCAST_MAGIC.len() + 1 + sender.encoded_len() + 8 + message.encoded_len()
}

/// Decode a framed envelope.
pub fn decode_envelope(data: &[u8]) -> DecodeOutcome {
    if data.len() < GROUPCAST_MAGIC.len() + 1 || !data.starts_with(GROUPCAST_MAGIC) {
        return DecodeOutcome::NotGroupcast;
    }

    let version = data[GROUPCAST_MAGIC.len()];
    if version != PROTOCOL_VERSION {
        return DecodeOutcome::IncompatibleVersion(version);
    }

    let mut buf = &data[GROUPCAST_MAGIC.len() + 1..];
    let sender = match NodeId::decode(&mut buf) {
        Some(sender) => sender,
        None => return DecodeOutcome::Malformed,
    };
    if buf.len() < 8 {
        return DecodeOutcome::Malformed;
    }
    let seq = u64::from_be_bytes(match buf[..8].try_into() {
        Ok(bytes) => bytes,
        Err(_) => return DecodeOutcome::Malformed,
    });
    buf = &buf[8..];

    match WireMessage::decode(&mut buf) {
        Some(message) => DecodeOutcome::Ok {
            sender,
            seq,
            message,
        },
        None => DecodeOutcome::Malformed,
    }
}

/// Check whether a raw frame carries the registry magic.
///
/// Useful when the transport is shared with other protocols.
pub fn is_groupcast_frame(data: &[u8]) -> bool {
    data.len() >= GROUPCAST_MAGIC.len() && data.starts_with(GROUPCAST_MAGIC)
}

/// Verdict for an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this frame is seen; process it.
    Fresh,
    /// Already seen, or older than the replay window; drop.
    Duplicate,
    /// Sender epoch is older than one already observed at its address;
    /// drop.
    StaleEpoch,
}

/// Sliding window over the sequences recently seen from one sender.
///
/// Bit `k` of `mask` records whether sequence `high - k` was seen.
/// Sequences more than [`REPLAY_WINDOW`] behind the highest are treated as
/// replays.
#[derive(Debug, Default, Clone, Copy)]
struct ReplayWindow {
    high: u64,
    mask: u64,
}

/// Depth of the per-sender replay window, in sequence numbers.
const REPLAY_WINDOW: u64 = 64;

impl ReplayWindow {
    fn admit(&mut self, seq: u64) -> Admission {
        if seq > self.high {
            let shift = seq - self.high;
            self.mask = if shift >= REPLAY_WINDOW {
                0
            } else {
                self.mask << shift
            };
            self.mask |= 1;
            self.high = seq;
            return Admission::Fresh;
        }
        let behind = self.high - seq;
        if behind >= REPLAY_WINDOW {
            return Admission::Duplicate;
        }
        let bit = 1u64 << behind;
        if self.mask & bit != 0 {
            return Admission::Duplicate;
        }
        self.mask |= bit;
        Admission::Fresh
    }
}

/// Per-peer replay and stale-epoch filter.
///
/// Tracks a sliding window of sequences per sender and the highest epoch
/// observed per address. Epoch knowledge only grows; sequence tracking for
/// a sender is discarded when the node is purged.
#[derive(Debug, Default)]
pub struct IngressLog {
    inner: Mutex<IngressInner>,
}

#[derive(Debug, Default)]
struct IngressInner {
    seen: HashMap<NodeId, ReplayWindow>,
    epochs: HashMap<SocketAddr, u64>,
}

impl IngressLog {
    /// Create an empty ingress log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify an inbound envelope and record it when fresh.
    pub fn admit(&self, sender: &NodeId, seq: u64) -> Admission {
        let mut inner = self.inner.lock();

        let highest_epoch = inner.epochs.entry(sender.addr()).or_insert(0);
        if sender.epoch() < *highest_epoch {
            return Admission::StaleEpoch;
        }
        *highest_epoch = sender.epoch();

        inner.seen.entry(*sender).or_default().admit(seq)
    }

    /// Drop sequence tracking for a purged node.
    ///
    /// The epoch high-water mark for its address is kept so that frames
    /// from the dead epoch stay stale.
    pub fn forget(&self, node: &NodeId) {
        self.inner.lock().seen.remove(node);
    }

    /// Number of senders currently tracked.
    pub fn tracked_senders(&self) -> usize {
        self.inner.lock().seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16, epoch: u64) -> NodeId {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        NodeId::new(addr, epoch)
    }

    #[test]
    fn test_envelope_round_trip() {
        let sender = node(9000, 5);
        let msg = WireMessage::Heartbeat;
        let encoded = encode_envelope(&sender, 42, &msg);
        assert_eq!(encoded.len(), envelope_encoded_len(&sender, &msg));
        assert!(is_groupcast_frame(&encoded));

        match decode_envelope(&encoded) {
            DecodeOutcome::Ok {
                sender: s,
                seq,
                message,
            } => {
                assert_eq!(s, sender);
                assert_eq!(seq, 42);
                assert_eq!(message, msg);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_decode_not_groupcast() {
        assert_eq!(decode_envelope(b"HTTP/1.1"), DecodeOutcome::NotGroupcast);
        assert_eq!(decode_envelope(b""), DecodeOutcome::NotGroupcast);
        assert_eq!(decode_envelope(b"GR"), DecodeOutcome::NotGroupcast);
    }

    #[test]
    fn test_decode_incompatible_version() {
        let sender = node(9000, 1);
        let encoded = encode_envelope(&sender, 1, &WireMessage::Heartbeat);
        let mut tampered = encoded.to_vec();
        tampered[3] = 0x7F;
        assert_eq!(
            decode_envelope(&tampered),
            DecodeOutcome::IncompatibleVersion(0x7F)
        );
    }

    #[test]
    fn test_decode_malformed() {
        let sender = node(9000, 1);
        let encoded = encode_envelope(&sender, 1, &WireMessage::Heartbeat);
        // Truncations past the magic and version are malformed, not foreign.
        for len in 4..encoded.len() {
            assert_eq!(
                decode_envelope(&encoded[..len]),
                DecodeOutcome::Malformed,
                "truncated at {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_admission_fresh_then_duplicate() {
        let log = IngressLog::new();
        let sender = node(9000, 1);

        assert_eq!(log.admit(&sender, 1), Admission::Fresh);
        assert_eq!(log.admit(&sender, 2), Admission::Fresh);
        assert_eq!(log.admit(&sender, 2), Admission::Duplicate);
        assert_eq!(log.admit(&sender, 1), Admission::Duplicate);
        assert_eq!(log.admit(&sender, 5), Admission::Fresh);
    }

    #[test]
    fn test_admission_tolerates_reordering() {
        let log = IngressLog::new();
        let sender = node(9000, 1);

        // Frames numbered by concurrent sender tasks can arrive slightly
        // out of order; each must still be admitted exactly once.
        for seq in [3u64, 1, 2, 5, 4] {
            assert_eq!(log.admit(&sender, seq), Admission::Fresh, "seq {}", seq);
        }
        for seq in 1..=5u64 {
            assert_eq!(log.admit(&sender, seq), Admission::Duplicate, "seq {}", seq);
        }
    }

    #[test]
    fn test_admission_window_floor() {
        let log = IngressLog::new();
        let sender = node(9000, 1);

        assert_eq!(log.admit(&sender, 1000), Admission::Fresh);
        // Within the window an unseen sequence is fresh.
        assert_eq!(log.admit(&sender, 990), Admission::Fresh);
        // Far behind the window everything counts as a replay.
        assert_eq!(log.admit(&sender, 100), Admission::Duplicate);
    }

    #[test]
    fn test_admission_stale_epoch() {
        let log = IngressLog::new();
        let old = node(9000, 10);
        let new = node(9000, 20);

        assert_eq!(log.admit(&old, 1), Admission::Fresh);
        // A restart at the same address takes over the address.
        assert_eq!(log.admit(&new, 1), Admission::Fresh);
        // Frames from the replaced epoch are now stale.
        assert_eq!(log.admit(&old, 2), Admission::StaleEpoch);
    }

    #[test]
    fn test_forget_keeps_epoch_guard() {
        let log = IngressLog::new();
        let sender = node(9000, 10);

        assert_eq!(log.admit(&sender, 1), Admission::Fresh);
        log.forget(&sender);
        assert_eq!(log.tracked_senders(), 0);

        // Sequence tracking restarts, the epoch guard does not.
        assert_eq!(log.admit(&sender, 1), Admission::Fresh);
        assert_eq!(log.admit(&node(9000, 5), 1), Admission::StaleEpoch);
    }

    #[test]
    fn test_independent_senders() {
        let log = IngressLog::new();
        let a = node(9000, 1);
        let b = node(9001, 1);

        assert_eq!(log.admit(&a, 3), Admission::Fresh);
        assert_eq!(log.admit(&b, 3), Admission::Fresh);
        assert_eq!(log.admit(&a, 3), Admission::Duplicate);
    }
}
