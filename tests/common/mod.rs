//! Shared test utilities: port allocation for TCP tests and an
//! in-memory cluster harness.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use groupcast::testing::{MemoryHub, MemoryTransport};
use groupcast::{Registry, RegistryConfig, Transport};

/// Global port allocator to prevent port conflicts across tests.
///
/// Ports can fail to bind due to TIME_WAIT from recent connections or
/// parallel test execution; the allocator verifies each port by binding
/// it before handing it out.
pub struct PortAllocator {
    next_port: AtomicU16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start_port: u16) -> Self {
        Self {
            next_port: AtomicU16::new(start_port),
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a single verified-bindable port.
    pub fn allocate(&self) -> u16 {
        self.allocate_n(1)[0]
    }

    /// Allocate N verified-bindable ports.
    pub fn allocate_n(&self, count: usize) -> Vec<u16> {
        let mut ports = Vec::with_capacity(count);
        let mut allocated = self.allocated.lock().unwrap();

        while ports.len() < count {
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            if port < 1024 || port >= 49152 {
                continue;
            }
            if allocated.contains(&port) {
                continue;
            }
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            if TcpListener::bind(addr).is_ok() {
                allocated.insert(port);
                ports.push(port);
            }
        }
        ports
    }
}

/// Global port allocator instance.
///
/// Starts at port 17000 to stay clear of common service ports and the
/// ephemeral range.
pub static PORT_ALLOCATOR: Lazy<PortAllocator> = Lazy::new(|| PortAllocator::new(17000));

/// Allocate a single available port.
pub fn allocate_port() -> u16 {
    PORT_ALLOCATOR.allocate()
}

/// Allocate multiple available ports.
pub fn allocate_ports(count: usize) -> Vec<u16> {
    PORT_ALLOCATOR.allocate_n(count)
}

/// Timings tightened so cluster tests settle in milliseconds.
pub fn fast_config() -> RegistryConfig {
    RegistryConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_failure_timeout(Duration::from_millis(400))
        .with_relink_grace(Duration::from_millis(100))
        .with_gossip_flush_interval(Duration::from_millis(10))
}

/// One running registry node on a [`MemoryHub`].
pub struct TestNode {
    pub registry: Registry<MemoryTransport>,
    pub addr: SocketAddr,
    run_task: tokio::task::JoinHandle<()>,
}

impl TestNode {
    pub async fn start(hub: &MemoryHub, addr: SocketAddr, config: RegistryConfig) -> Self {
        let (transport, mailbox) = hub.transport(addr);
        let registry = Registry::new(transport, mailbox, config);
        let run_task = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run().await }
        });
        Self {
            registry,
            addr,
            run_task,
        }
    }
}

/// A cluster of in-memory registry nodes.
pub struct TestCluster {
    pub hub: MemoryHub,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `count` nodes on one hub. Nodes are not linked yet; call
    /// [`mesh`](Self::mesh) or connect selectively.
    pub async fn start(count: usize, config: RegistryConfig) -> Self {
        let hub = MemoryHub::new();
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let addr: SocketAddr = format!("10.1.0.{}:7900", i + 1).parse().unwrap();
            nodes.push(TestNode::start(&hub, addr, config.clone()).await);
        }
        Self { hub, nodes }
    }

    /// Link every node to every other node.
    pub async fn mesh(&self) {
        for i in 0..self.nodes.len() {
            for j in (i + 1)..self.nodes.len() {
                self.nodes[i]
                    .registry
                    .connect(self.nodes[j].addr)
                    .await
                    .expect("mesh connect failed");
            }
        }
    }

    /// Block until every node sees `expected` members in `group`, or
    /// panic after five seconds.
    pub async fn wait_members(&self, group: &str, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let converged = self
                .nodes
                .iter()
                .all(|node| node.registry.members(group).len() == expected);
            if converged {
                return;
            }
            if Instant::now() > deadline {
                let counts: Vec<usize> = self
                    .nodes
                    .iter()
                    .map(|node| node.registry.members(group).len())
                    .collect();
                panic!("group {group:?} did not converge to {expected} members, saw {counts:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shut every node down and join their run tasks.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.registry.shutdown().await;
        }
        for node in self.nodes {
            let _ = node.run_task.await;
        }
    }
}

/// Block until one node sees `expected` members in `group`, or panic
/// after five seconds.
pub async fn wait_members_on<T: Transport>(registry: &Registry<T>, group: &str, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let count = registry.members(group).len();
        if count == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!("group {group:?} did not reach {expected} members, saw {count}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
