//! Metrics for the group registry.
//!
//! Provides counters, gauges, and histograms for monitoring a node.
//!
//! ## Available Metrics
//!
//! ### Counters
//! - `groupcast_broadcasts_total` - Broadcasts initiated on this node
//! - `groupcast_queries_total` - Scatter-gather queries initiated
//! - `groupcast_query_hits_total` - Queries resolved with an answer
//! - `groupcast_query_timeouts_total` - Queries that hit their deadline
//! - `groupcast_nodes_up_total` - Peers admitted to the cluster
//! - `groupcast_nodes_down_total` - Peers declared dead
//! - `groupcast_frames_received_total` - Envelopes accepted from peers
//! - `groupcast_frames_rejected_total` - Envelopes rejected as malformed
//! - `groupcast_events_flushed_total` - Membership events gossiped out
//! - `groupcast_snapshots_sent_total` - Directory snapshots sent to peers
//!
//! ### Histograms
//! - `groupcast_cast_fanout` - Deliveries per broadcast
//! - `groupcast_snapshot_entries` - Entries per directory snapshot
//!
//! ### Gauges
//! - `groupcast_connected_peers` - Peers currently linked

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize metric descriptions.
///
/// Call this once at application startup to register all metric
/// descriptions. This makes metrics more discoverable in monitoring
/// systems.
pub fn init_metrics() {
    // Counters
    describe_counter!(
        "groupcast_broadcasts_total",
        "Total number of broadcasts initiated on this node"
    );
    describe_counter!(
        "groupcast_queries_total",
        "Total number of scatter-gather queries initiated"
    );
    describe_counter!(
        "groupcast_query_hits_total",
        "Total number of queries resolved with an answer"
    );
    describe_counter!(
        "groupcast_query_timeouts_total",
        "Total number of queries that hit their deadline unanswered"
    );
    describe_counter!(
        "groupcast_nodes_up_total",
        "Total number of peers admitted to the cluster"
    );
    describe_counter!(
        "groupcast_nodes_down_total",
        "Total number of peers declared dead"
    );
    describe_counter!(
        "groupcast_frames_received_total",
        "Total number of envelopes accepted from peers"
    );
    describe_counter!(
        "groupcast_frames_rejected_total",
        "Total number of envelopes rejected as malformed"
    );
    describe_counter!(
        "groupcast_events_flushed_total",
        "Total number of membership events gossiped to peers"
    );
    describe_counter!(
        "groupcast_snapshots_sent_total",
        "Total number of directory snapshots sent to peers"
    );

    // Histograms
    describe_histogram!("groupcast_cast_fanout", "Number of deliveries per broadcast");
    describe_histogram!(
        "groupcast_snapshot_entries",
        "Number of entries per directory snapshot"
    );

    // Gauges
    describe_gauge!(
        "groupcast_connected_peers",
        "Current number of linked peers"
    );
}

/// Record a broadcast.
pub fn record_broadcast() {
    counter!("groupcast_broadcasts_total").increment(1);
}

/// Record the number of deliveries one broadcast produced.
pub fn record_cast_fanout(deliveries: usize) {
    histogram!("groupcast_cast_fanout").record(deliveries as f64);
}

/// Record a scatter-gather query.
pub fn record_query() {
    counter!("groupcast_queries_total").increment(1);
}

/// Record a query resolved with an answer.
pub fn record_query_hit() {
    counter!("groupcast_query_hits_total").increment(1);
}

/// Record a query that hit its deadline.
pub fn record_query_timeout() {
    counter!("groupcast_query_timeouts_total").increment(1);
}

/// Record a peer being admitted.
pub fn record_node_up() {
    counter!("groupcast_nodes_up_total").increment(1);
}

/// Record a peer being declared dead.
pub fn record_node_down() {
    counter!("groupcast_nodes_down_total").increment(1);
}

/// Record an accepted envelope.
pub fn record_frame_received() {
    counter!("groupcast_frames_received_total").increment(1);
}

/// Record a rejected envelope.
pub fn record_frame_rejected() {
    counter!("groupcast_frames_rejected_total").increment(1);
}

/// Record membership events flushed to peers.
pub fn record_events_flushed(count: usize) {
    counter!("groupcast_events_flushed_total").increment(count as u64);
}

/// Record a directory snapshot sent to a peer.
pub fn record_snapshot_sent(entries: usize) {
    counter!("groupcast_snapshots_sent_total").increment(1);
    histogram!("groupcast_snapshot_entries").record(entries as f64);
}

/// Update the connected peers gauge.
pub fn set_connected_peers(count: usize) {
    gauge!("groupcast_connected_peers").set(count as f64);
}
