//! End-to-end runs over the real TCP transport: handshake, directory
//! convergence, broadcast, scatter-gather, and crash detection via EOF.

#![cfg(feature = "tcp")]

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{allocate_port, fast_config, wait_members_on};
use groupcast::{
    Delivery, PeerStatus, Registry, RegistryConfig, TcpConfig, TcpTransport, Transport,
};

struct TcpNode {
    registry: Registry<TcpTransport>,
    transport: TcpTransport,
    addr: SocketAddr,
    run_task: tokio::task::JoinHandle<()>,
}

impl TcpNode {
    async fn start(config: RegistryConfig) -> Self {
        let port = allocate_port();
        let bind: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let (transport, mailbox) = TcpTransport::bind(bind, TcpConfig::new())
            .await
            .expect("bind tcp transport");
        let addr = transport.local_addr();
        let registry = Registry::new(transport.clone(), mailbox, config);
        let run_task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run().await })
        };
        Self {
            registry,
            transport,
            addr,
            run_task,
        }
    }

    async fn stop(self) {
        self.registry.shutdown().await;
        let _ = self.run_task.await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_cluster_end_to_end() {
    let alpha = TcpNode::start(fast_config()).await;
    let beta = TcpNode::start(fast_config()).await;

    let beta_node = alpha.registry.connect(beta.addr).await.unwrap();
    assert_eq!(beta_node, beta.registry.local_node());

    let (a_member, a_rx) = alpha.registry.register().unwrap();
    alpha.registry.join("workers", a_member.handle()).unwrap();
    let (b_member, b_rx) = beta.registry.register().unwrap();
    beta.registry.join("workers", b_member.handle()).unwrap();

    wait_members_on(&alpha.registry, "workers", 2).await;
    wait_members_on(&beta.registry, "workers", 2).await;

    // Broadcast crosses the wire exactly once per member.
    let report = alpha
        .registry
        .broadcast("workers", Bytes::from_static(b"release"), Some(a_member.handle()))
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.is_complete());

    let delivery = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
        .await
        .expect("no delivery within 2s")
        .expect("mailbox closed");
    match delivery {
        Delivery::Cast(payload) => assert_eq!(payload.as_ref(), b"release"),
        other => panic!("expected a cast, got {other:?}"),
    }

    // The remote member answers a query over the same link.
    tokio::spawn(async move {
        while let Ok(delivery) = b_rx.recv().await {
            if let Delivery::Call(token, payload) = delivery {
                assert_eq!(payload.as_ref(), b"which version");
                token.hit(Bytes::from_static(b"1.4.2"));
            }
        }
    });
    let hit = alpha
        .registry
        .query("workers", Bytes::from_static(b"which version"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hit.payload.as_ref(), b"1.4.2");
    assert_eq!(hit.responder, beta_node);

    drop(a_rx);
    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_crash_detected_by_eof() {
    let alpha = TcpNode::start(fast_config()).await;
    let beta = TcpNode::start(fast_config()).await;

    let beta_node = alpha.registry.connect(beta.addr).await.unwrap();
    let (b_member, _b_rx) = beta.registry.register().unwrap();
    beta.registry.join("workers", b_member.handle()).unwrap();
    wait_members_on(&alpha.registry, "workers", 1).await;

    // Kill the transport underneath the registry: sockets close without
    // any goodbye, the survivor sees EOF and starts the relink grace.
    beta.transport.shutdown().await;

    let deadline = Instant::now() + Duration::from_secs(3);
    while alpha.registry.peer_status(&beta_node) != PeerStatus::Dead {
        assert!(Instant::now() < deadline, "crash was never detected");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(alpha.registry.members("workers").is_empty());

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_graceful_shutdown_says_goodbye() {
    let alpha = TcpNode::start(fast_config()).await;
    let beta = TcpNode::start(fast_config()).await;

    let beta_node = alpha.registry.connect(beta.addr).await.unwrap();
    let (b_member, _b_rx) = beta.registry.register().unwrap();
    beta.registry.join("workers", b_member.handle()).unwrap();
    wait_members_on(&alpha.registry, "workers", 1).await;

    // A goodbye drops the peer without waiting out any grace period.
    let started = Instant::now();
    beta.stop().await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while alpha.registry.peer_status(&beta_node) != PeerStatus::Dead {
        assert!(Instant::now() < deadline, "goodbye was never processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Faster than the silence-based path would allow.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(alpha.registry.members("workers").is_empty());

    alpha.stop().await;
}
