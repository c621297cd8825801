//! Scatter-gather queries across nodes: the first hit wins, misses and
//! dead peers never fail a query, and the deadline is honored exactly.

mod common;

use std::time::{Duration, Instant};

use async_channel::Receiver;
use bytes::Bytes;
use common::{fast_config, TestCluster};
use groupcast::{Delivery, Error};

/// Answer every call arriving on `rx` after `delay`; `Some` payload is a
/// hit, `None` an explicit miss.
fn answer_calls(rx: Receiver<Delivery>, delay: Duration, reply: Option<&'static [u8]>) {
    tokio::spawn(async move {
        while let Ok(delivery) = rx.recv().await {
            if let Delivery::Call(token, _) = delivery {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                match reply {
                    Some(bytes) => token.hit(Bytes::from_static(bytes)),
                    None => token.miss(),
                }
            }
        }
    });
}

#[tokio::test]
async fn test_first_answer_wins() {
    let cluster = TestCluster::start(3, fast_config()).await;
    cluster.mesh().await;

    let mut keep = Vec::new();
    let plans: [(Duration, Option<&'static [u8]>); 3] = [
        (Duration::ZERO, None),
        (Duration::from_millis(10), Some(b"v1")),
        (Duration::from_millis(50), Some(b"v2")),
    ];
    for (node, (delay, reply)) in cluster.nodes.iter().zip(plans) {
        let (member, rx) = node.registry.register().unwrap();
        node.registry.join("kv", member.handle()).unwrap();
        answer_calls(rx, delay, reply);
        keep.push(member);
    }
    cluster.wait_members("kv", 3).await;

    let hit = cluster.nodes[0]
        .registry
        .query("kv", Bytes::from_static(b"lookup"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hit.payload.as_ref(), b"v1");
    assert_eq!(hit.responder, cluster.nodes[1].registry.local_node());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remote_member_answers() {
    let cluster = TestCluster::start(2, fast_config()).await;
    cluster.mesh().await;

    let (beta, beta_rx) = cluster.nodes[1].registry.register().unwrap();
    cluster.nodes[1].registry.join("kv", beta.handle()).unwrap();
    answer_calls(beta_rx, Duration::ZERO, Some(b"pong"));
    cluster.wait_members("kv", 1).await;

    let hit = cluster.nodes[0]
        .registry
        .query("kv", Bytes::from_static(b"ping"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hit.payload.as_ref(), b"pong");
    assert_eq!(hit.responder, cluster.nodes[1].registry.local_node());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_empty_group_waits_full_deadline() {
    let cluster = TestCluster::start(2, fast_config()).await;
    cluster.mesh().await;

    let started = Instant::now();
    let outcome = cluster.nodes[0]
        .registry
        .query("ghosts", Bytes::from_static(b"anyone"), Duration::from_millis(50))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(Error::NotFound)));
    assert!(elapsed >= Duration::from_millis(50), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "overslept: {elapsed:?}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_all_misses_run_out_the_clock() {
    let cluster = TestCluster::start(2, fast_config()).await;
    cluster.mesh().await;

    let mut keep = Vec::new();
    for node in &cluster.nodes {
        let (member, rx) = node.registry.register().unwrap();
        node.registry.join("kv", member.handle()).unwrap();
        answer_calls(rx, Duration::ZERO, None);
        keep.push(member);
    }
    cluster.wait_members("kv", 2).await;

    // Misses are informational; only the deadline ends the wait.
    let started = Instant::now();
    let outcome = cluster.nodes[0]
        .registry
        .query("kv", Bytes::from_static(b"lookup"), Duration::from_millis(150))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, Err(Error::NotFound)));
    assert!(elapsed >= Duration::from_millis(150), "returned early: {elapsed:?}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dead_peer_does_not_fail_query() {
    let cluster = TestCluster::start(3, fast_config()).await;
    cluster.mesh().await;

    let (beta, beta_rx) = cluster.nodes[1].registry.register().unwrap();
    cluster.nodes[1].registry.join("kv", beta.handle()).unwrap();
    answer_calls(beta_rx, Duration::ZERO, Some(b"never"));

    let (gamma, gamma_rx) = cluster.nodes[2].registry.register().unwrap();
    cluster.nodes[2].registry.join("kv", gamma.handle()).unwrap();
    answer_calls(gamma_rx, Duration::from_millis(20), Some(b"survivor"));

    cluster.wait_members("kv", 2).await;

    let beta_node = cluster.nodes[1].registry.local_node();
    cluster.hub.kill(&beta_node);

    // The call to the dead peer fails on send; the live member still
    // resolves the query.
    let hit = cluster.nodes[0]
        .registry
        .query("kv", Bytes::from_static(b"lookup"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hit.payload.as_ref(), b"survivor");
    assert_eq!(hit.responder, cluster.nodes[2].registry.local_node());

    cluster.shutdown().await;
}
