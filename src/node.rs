//! Node identity for the registry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{
    fmt::{self, Debug, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

/// Address family tag for the wire encoding.
const ADDR_TAG_V4: u8 = 4;
const ADDR_TAG_V6: u8 = 6;

/// Identity of a cluster participant.
///
/// Composed of the node's listen address and an epoch minted at process
/// start. Two `NodeId`s with the same address but different epochs are
/// different nodes: a restarted process is a brand-new identity and never
/// inherits the state of its predecessor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    addr: SocketAddr,
    epoch: u64,
}

impl NodeId {
    /// Maximum size of a node ID in bytes when encoded (IPv6 form).
    pub const MAX_ENCODED_SIZE: usize = 1 + 16 + 2 + 8;

    /// Create a node ID from an address and an explicit epoch.
    pub const fn new(addr: SocketAddr, epoch: u64) -> Self {
        Self { addr, epoch }
    }

    /// Create a node ID for a fresh process lifetime at the given address.
    ///
    /// Mints a new epoch from the current wall clock.
    pub fn fresh(addr: SocketAddr) -> Self {
        Self {
            addr,
            epoch: mint_epoch(),
        }
    }

    /// Get the listen address.
    #[inline]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the epoch component.
    #[inline]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Encode the node ID into bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(ADDR_TAG_V4);
                buf.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(ADDR_TAG_V6);
                buf.put_slice(&ip.octets());
            }
        }
        buf.put_u16(self.addr.port());
        buf.put_u64(self.epoch);
    }

    /// Encode the node ID into a new Bytes buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Calculate the encoded length of this node ID.
    pub const fn encoded_len(&self) -> usize {
        match self.addr {
            SocketAddr::V4(_) => 1 + 4 + 2 + 8,
            SocketAddr::V6(_) => 1 + 16 + 2 + 8,
        }
    }

    /// Decode a node ID from bytes.
    ///
    /// Returns `None` if the buffer is too small or the address tag is
    /// unknown.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 1 {
            return None;
        }
        let ip = match buf.get_u8() {
            ADDR_TAG_V4 => {
                if buf.remaining() < 4 + 2 + 8 {
                    return None;
                }
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDR_TAG_V6 => {
                if buf.remaining() < 16 + 2 + 8 {
                    return None;
                }
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        let port = buf.get_u16();
        let epoch = buf.get_u64();
        Some(Self {
            addr: SocketAddr::new(ip, port),
            epoch,
        })
    }

    /// Decode a node ID from a byte slice.
    pub fn decode_from_slice(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        Self::decode(&mut buf)
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}@{:016x})", self.addr, self.epoch)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shortened display format: address plus the low epoch bits.
        write!(f, "{}@{:08x}", self.addr, (self.epoch & 0xFFFF_FFFF) as u32)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            let bytes = self.encode_to_bytes();
            serializer.serialize_bytes(&bytes)
        }
    }
}

/// Mint a new epoch for a process lifetime.
///
/// The high bits carry milliseconds since the UNIX epoch so that epochs at
/// one address are monotonic across restarts; the low 16 bits are random to
/// separate restarts within the same millisecond.
pub fn mint_epoch() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (millis << 16) | rand::random::<u16>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_fresh_epochs_differ() {
        let a = NodeId::fresh(addr("127.0.0.1:9000"));
        let b = NodeId::fresh(addr("127.0.0.1:9000"));
        assert_ne!(a, b, "restart at the same address must mint a new epoch");
        assert_eq!(a.addr(), b.addr());
    }

    #[test]
    fn test_encode_decode_v4() {
        let id = NodeId::new(addr("192.168.1.10:7001"), 0xDEADBEEF);
        let encoded = id.encode_to_bytes();
        assert_eq!(encoded.len(), id.encoded_len());

        let decoded = NodeId::decode_from_slice(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_encode_decode_v6() {
        let id = NodeId::new(addr("[::1]:7002"), 42);
        let encoded = id.encode_to_bytes();
        assert_eq!(encoded.len(), id.encoded_len());
        assert_eq!(encoded.len(), NodeId::MAX_ENCODED_SIZE);

        let decoded = NodeId::decode_from_slice(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn test_decode_truncated() {
        let id = NodeId::fresh(addr("10.0.0.1:8000"));
        let encoded = id.encode_to_bytes();
        for len in 0..encoded.len() {
            assert!(NodeId::decode_from_slice(&encoded[..len]).is_none());
        }
    }

    #[test]
    fn test_decode_bad_tag() {
        let data = [0xFFu8; 32];
        assert!(NodeId::decode_from_slice(&data).is_none());
    }

    #[test]
    fn test_epoch_ordering_across_restarts() {
        // Millisecond bits dominate, so later restarts compare greater.
        let early = (1_000u64 << 16) | 0xFFFF;
        let late = (2_000u64 << 16) | 0x0000;
        assert!(late > early);
    }
}
