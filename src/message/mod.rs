//! Wire message types and framing for the registry protocol.
//!
//! This module contains:
//! - [`WireMessage`] - Protocol message types
//! - [`Envelope framing`](encode_envelope) - Magic, version, sender and
//!   sequence number around each frame
//! - [`IngressLog`] - Replay and stale-epoch filtering for inbound frames

mod envelope;
mod types;

pub use envelope::{
    decode_envelope, encode_envelope, envelope_encoded_len, is_groupcast_frame, Admission,
    DecodeOutcome, IngressLog, GROUPCAST_MAGIC, MIN_ENVELOPE_SIZE, PROTOCOL_VERSION,
};
pub use types::{
    EventAction, MemberEntry, MembershipEvent, MessageTag, WireMessage, MAX_EVENT_BATCH,
    MAX_FRAME_TARGETS, MAX_GROUP_LEN, MAX_SNAPSHOT_ENTRIES,
};
