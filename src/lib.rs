//! # groupcast
//!
//! Distributed group membership and broadcast registry.
//!
//! Every node keeps a replicated directory of named groups and their
//! members. Local members join and leave groups through handles; the
//! membership converges across the cluster through snapshots and
//! incremental gossip, and payloads reach whole groups through
//! broadcast fan-out or scatter-gather queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Application                           │
//! │              (LocalMember mailboxes, Delivery)               │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ register() / join() / broadcast()
//! ┌───────────────────────────▼─────────────────────────────────┐
//! │                         Registry                             │
//! │    (group API, broadcast fan-out, scatter-gather, gossip)    │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  Directory   │   Tracker    │ EventOutbox  │   IngressLog   │
//! │ (groups/sync)│  (liveness)  │  (batching)  │ (dedup/epoch)  │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │                        Transport                             │
//! │         (TCP links, or the in-memory test transport)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## API Entry Points
//!
//! | API | Use Case |
//! |-----|----------|
//! | [`Registry`] | Production - the full registry over a transport |
//! | [`Transport`] | Bring your own wire; the registry drives it |
//! | [`testing::MemoryHub`] | Whole clusters in one test process |
//!
//! ## How It Works
//!
//! - **Snapshot then events**: a newly linked peer receives the full
//!   directory first, then incremental join/leave batches; its members
//!   stay invisible until the snapshot completes
//! - **Epoch identity**: a node is its address plus a restart epoch;
//!   a restarted node is a new identity, and frames from older epochs
//!   of the same address are silently discarded
//! - **Silence kills**: a dropped link only makes a peer suspect, with
//!   a grace period to relink and resynchronize; silence past the
//!   failure timeout is what declares it dead, permanently for that
//!   epoch
//!
//! ## Example
//!
//! ```ignore
//! use groupcast::{Delivery, Registry, RegistryConfig, TcpConfig, TcpTransport};
//! use bytes::Bytes;
//!
//! let (transport, mailbox) =
//!     TcpTransport::bind("0.0.0.0:7946".parse()?, TcpConfig::default()).await?;
//! let registry = Registry::new(transport, mailbox, RegistryConfig::default());
//! tokio::spawn({
//!     let registry = registry.clone();
//!     async move { registry.run().await }
//! });
//!
//! // Join the cluster through any existing node.
//! registry.connect("10.0.0.1:7946".parse()?).await?;
//!
//! // Register a member and join a group.
//! let (member, deliveries) = registry.register()?;
//! registry.join("workers", member.handle())?;
//!
//! // Broadcast to the whole group, excluding ourselves.
//! registry
//!     .broadcast("workers", Bytes::from("hello"), Some(member.handle()))
//!     .await?;
//!
//! // Serve deliveries.
//! while let Ok(delivery) = deliveries.recv().await {
//!     match delivery {
//!         Delivery::Cast(payload) => println!("cast: {payload:?}"),
//!         Delivery::Call(token, _payload) => token.hit(Bytes::from("answer")),
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

mod bootstrap;
mod config;
mod directory;
mod error;
mod fanout;
mod gather;
mod member;
mod message;
mod node;
mod outbox;
mod registry;
pub mod testing;
mod tracker;
mod transport;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

// Re-export bootstrap types
pub use bootstrap::{run_bootstrap, BootstrapConfig};

// Re-export config types
pub use config::RegistryConfig;

// Re-export directory types
pub use directory::{DirectoryStats, SyncState};

// Re-export error types
pub use error::{Error, Result};

// Re-export broadcast fan-out types
pub use fanout::BroadcastReport;

// Re-export scatter-gather types
pub use gather::{QueryHit, ReplyToken};

// Re-export member types
pub use member::{Delivery, MemberHandle};

// Re-export wire format types
pub use message::{
    decode_envelope, encode_envelope, envelope_encoded_len, is_groupcast_frame, DecodeOutcome,
    EventAction, MemberEntry, MembershipEvent, MessageTag, WireMessage,
};

// Re-export node identity types
pub use node::NodeId;

// Re-export registry types
pub use registry::{LocalMember, Registry, RegistryStats};

// Re-export cluster tracker types
pub use tracker::{ClusterEvent, PeerStatus, TrackerStats};

// Re-export transport types
pub use transport::{
    LinkEvent, MailboxSender, NoopTransport, Transport, TransportError, TransportEvent,
    TransportMailbox,
};

// Re-export TCP transport types (requires "tcp" feature)
#[cfg(feature = "tcp")]
#[cfg_attr(docsrs, doc(cfg(feature = "tcp")))]
pub use transport::tcp::{TcpConfig, TcpTransport};
