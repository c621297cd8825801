//! Configuration for the groupcast registry.

use std::time::Duration;

/// Configuration options for a registry node.
///
/// These parameters control the balance between convergence latency,
/// failure detection speed, and resource usage.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistryConfig {
    /// Interval between heartbeat frames to every connected peer.
    ///
    /// Heartbeats keep links warm when no membership traffic flows and
    /// drive the failure detector on the receiving side.
    ///
    /// Default: 1s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub heartbeat_interval: Duration,

    /// How long a peer may stay silent before it is declared dead.
    ///
    /// Any inbound frame refreshes the deadline. A peer that misses it is
    /// purged from the directory and reported as `NodeDown`.
    ///
    /// Default: 5s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub failure_timeout: Duration,

    /// Grace period after a link drop before the peer is declared dead.
    ///
    /// A peer whose link comes back within the grace is resynchronized
    /// without a `NodeDown`; one that stays unlinked is purged even if its
    /// failure timeout has not elapsed yet.
    ///
    /// Default: 2s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub relink_grace: Duration,

    /// Interval for flushing batched membership events to peers.
    ///
    /// Shorter intervals reduce convergence latency but increase frame
    /// count.
    ///
    /// Default: 25ms
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub gossip_flush_interval: Duration,

    /// Maximum number of membership events to batch into one frame.
    ///
    /// Default: 64
    pub gossip_batch_size: usize,

    /// Maximum number of membership events buffered for flushing.
    ///
    /// When the buffer is full, new events are dropped and counted.
    /// Peers recover the lost state on their next full snapshot.
    ///
    /// Default: 8192
    pub max_pending_events: usize,

    /// Number of directory entries per snapshot frame.
    ///
    /// Snapshots larger than this are split into multiple frames, with
    /// the final frame marked as last.
    ///
    /// Default: 1024
    pub snapshot_chunk_size: usize,

    /// Maximum group name length in bytes.
    ///
    /// Default: 128
    pub max_group_len: usize,

    /// Maximum broadcast or query payload size.
    ///
    /// Payloads larger than this are rejected before any fan-out.
    ///
    /// Default: 64KB
    pub max_payload_size: usize,

    /// Number of lock shards for the group directory.
    ///
    /// Rounded up to the next power of two. Each group maps to exactly
    /// one shard, so updates to different groups rarely contend.
    ///
    /// Default: 16
    pub shard_count: usize,

    /// Capacity of internal channels (cluster event subscriptions and
    /// reply routing).
    ///
    /// Default: 1024
    pub channel_capacity: usize,

    /// Capacity of each member's delivery mailbox.
    ///
    /// A member that stops draining its mailbox loses deliveries once the
    /// mailbox is full; other members are unaffected.
    ///
    /// Default: 256
    pub mailbox_capacity: usize,

    /// Timeout for establishing a link to a peer.
    ///
    /// Default: 3s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub connect_timeout: Duration,

    /// Enable metrics collection.
    ///
    /// Default: true (if metrics feature is enabled)
    #[cfg(feature = "metrics")]
    pub enable_metrics: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(5),
            relink_grace: Duration::from_secs(2),
            gossip_flush_interval: Duration::from_millis(25),
            gossip_batch_size: 64,
            max_pending_events: 8192,
            snapshot_chunk_size: 1024,
            max_group_len: 128,
            max_payload_size: 64 * 1024, // 64KB
            shard_count: 16,
            channel_capacity: 1024,
            mailbox_capacity: 256,
            connect_timeout: Duration::from_secs(3),
            #[cfg(feature = "metrics")]
            enable_metrics: true,
        }
    }
}

impl RegistryConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration optimized for LAN environments.
    ///
    /// - Faster failure detection
    /// - Tighter convergence latency
    pub fn lan() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            failure_timeout: Duration::from_secs(2),
            relink_grace: Duration::from_secs(1),
            gossip_flush_interval: Duration::from_millis(10),
            gossip_batch_size: 64,
            max_pending_events: 8192,
            snapshot_chunk_size: 1024,
            max_group_len: 128,
            max_payload_size: 64 * 1024,
            shard_count: 16,
            channel_capacity: 1024,
            mailbox_capacity: 256,
            connect_timeout: Duration::from_secs(1),
            #[cfg(feature = "metrics")]
            enable_metrics: true,
        }
    }

    /// Configuration optimized for WAN environments.
    ///
    /// - Higher latency tolerance
    /// - Larger event batches
    pub fn wan() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            failure_timeout: Duration::from_secs(10),
            relink_grace: Duration::from_secs(4),
            gossip_flush_interval: Duration::from_millis(100),
            gossip_batch_size: 64,
            max_pending_events: 16384,
            snapshot_chunk_size: 1024,
            max_group_len: 128,
            max_payload_size: 64 * 1024,
            shard_count: 16,
            channel_capacity: 1024,
            mailbox_capacity: 256,
            connect_timeout: Duration::from_secs(5),
            #[cfg(feature = "metrics")]
            enable_metrics: true,
        }
    }

    /// Configuration for large clusters (100+ nodes).
    ///
    /// - More directory shards to spread lock contention
    /// - Larger buffers to absorb membership churn
    pub fn large_cluster() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(8),
            relink_grace: Duration::from_secs(2),
            gossip_flush_interval: Duration::from_millis(50),
            gossip_batch_size: 128,
            max_pending_events: 32768,
            snapshot_chunk_size: 2048,
            max_group_len: 128,
            max_payload_size: 64 * 1024,
            shard_count: 64,
            channel_capacity: 4096,
            mailbox_capacity: 512,
            connect_timeout: Duration::from_secs(3),
            #[cfg(feature = "metrics")]
            enable_metrics: true,
        }
    }

    /// Set the heartbeat interval (builder pattern).
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the failure timeout (builder pattern).
    ///
    /// Should be several multiples of the heartbeat interval; a timeout
    /// shorter than one heartbeat declares every peer dead.
    pub const fn with_failure_timeout(mut self, timeout: Duration) -> Self {
        self.failure_timeout = timeout;
        self
    }

    /// Set the relink grace period (builder pattern).
    pub const fn with_relink_grace(mut self, grace: Duration) -> Self {
        self.relink_grace = grace;
        self
    }

    /// Set the gossip flush interval (builder pattern).
    pub const fn with_gossip_flush_interval(mut self, interval: Duration) -> Self {
        self.gossip_flush_interval = interval;
        self
    }

    /// Set the gossip batch size (builder pattern).
    pub const fn with_gossip_batch_size(mut self, size: usize) -> Self {
        self.gossip_batch_size = size;
        self
    }

    /// Set the pending event buffer capacity (builder pattern).
    pub const fn with_max_pending_events(mut self, size: usize) -> Self {
        self.max_pending_events = size;
        self
    }

    /// Set the snapshot chunk size (builder pattern).
    pub const fn with_snapshot_chunk_size(mut self, size: usize) -> Self {
        self.snapshot_chunk_size = size;
        self
    }

    /// Set the maximum group name length (builder pattern).
    pub const fn with_max_group_len(mut self, len: usize) -> Self {
        self.max_group_len = len;
        self
    }

    /// Set the maximum payload size (builder pattern).
    pub const fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the directory shard count (builder pattern).
    pub const fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count;
        self
    }

    /// Set the internal channel capacity (builder pattern).
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the member mailbox capacity (builder pattern).
    pub const fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set the connect timeout (builder pattern).
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            // Simple parsing: expect "Nms" format
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}
