//! Distributed key-value lookups with scatter-gather queries.
//!
//! Three nodes run in one process over real TCP sockets, each holding a
//! private slice of the data. A lookup fans out to every member of the
//! `pantheon` group and resolves with the first hit; keys nobody holds
//! run out the deadline.
//!
//! Run with: cargo run --example kv

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use groupcast::{Delivery, Error, Registry, RegistryConfig, TcpConfig, TcpTransport};

const GROUP: &str = "pantheon";

struct KvNode {
    registry: Registry<TcpTransport>,
    addr: SocketAddr,
    run_task: tokio::task::JoinHandle<()>,
}

async fn start_node() -> Result<KvNode, Box<dyn std::error::Error>> {
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    let (transport, mailbox) = TcpTransport::bind(bind, TcpConfig::new()).await?;
    let addr = transport.local_addr();
    let registry = Registry::new(transport, mailbox, RegistryConfig::lan());
    let run_task = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run().await })
    };
    Ok(KvNode {
        registry,
        addr,
        run_task,
    })
}

/// Serve lookups against this node's slice of the data. Hits answer with
/// the value; everything else is an explicit miss.
fn serve(registry: &Registry<TcpTransport>, data: HashMap<&'static str, &'static str>) {
    let (member, deliveries) = registry.register().expect("register member");
    registry.join(GROUP, member.handle()).expect("join group");
    tokio::spawn(async move {
        // The member stays registered for as long as this task runs.
        let _member = member;
        while let Ok(delivery) = deliveries.recv().await {
            if let Delivery::Call(token, key) = delivery {
                let value = std::str::from_utf8(&key)
                    .ok()
                    .and_then(|k| data.get(k).copied());
                match value {
                    Some(value) => token.hit(Bytes::from_static(value.as_bytes())),
                    None => token.miss(),
                }
            }
        }
    });
}

async fn lookup(registry: &Registry<TcpTransport>, key: &str) {
    let started = Instant::now();
    let outcome = registry
        .query(GROUP, Bytes::from(key.to_string()), Duration::from_millis(500))
        .await;
    match outcome {
        Ok(hit) => println!(
            "  {key} = {} (from {}, {:?})",
            String::from_utf8_lossy(&hit.payload),
            hit.responder,
            started.elapsed()
        ),
        Err(Error::NotFound) => println!("  {key}: not found after {:?}", started.elapsed()),
        Err(err) => println!("  {key}: {err}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groupcast=warn".into()),
        )
        .init();

    println!("starting three nodes...");
    let nodes = [start_node().await?, start_node().await?, start_node().await?];
    for node in &nodes {
        println!("  {} at {}", node.registry.local_node(), node.addr);
    }

    nodes[0].registry.connect(nodes[1].addr).await?;
    nodes[0].registry.connect(nodes[2].addr).await?;
    nodes[1].registry.connect(nodes[2].addr).await?;

    serve(&nodes[0].registry, HashMap::from([("ares", "war")]));
    serve(
        &nodes[1].registry,
        HashMap::from([("athena", "wisdom"), ("apollo", "sun")]),
    );
    serve(&nodes[2].registry, HashMap::from([("poseidon", "sea")]));

    // Wait for the directory to converge on all three members.
    let deadline = Instant::now() + Duration::from_secs(5);
    while nodes.iter().any(|n| n.registry.members(GROUP).len() < 3) {
        if Instant::now() > deadline {
            return Err("cluster did not converge".into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!(
        "group {GROUP:?} has {} members\n",
        nodes[0].registry.members(GROUP).len()
    );

    println!("lookups from {}:", nodes[0].registry.local_node());
    lookup(&nodes[0].registry, "ares").await;
    lookup(&nodes[0].registry, "athena").await;
    lookup(&nodes[0].registry, "poseidon").await;
    lookup(&nodes[0].registry, "zeus").await;

    println!("\nlookups from {}:", nodes[2].registry.local_node());
    lookup(&nodes[2].registry, "apollo").await;
    lookup(&nodes[2].registry, "ares").await;

    for node in &nodes {
        node.registry.shutdown().await;
    }
    for node in nodes {
        let _ = tokio::time::timeout(Duration::from_secs(1), node.run_task).await;
    }
    println!("\ndone");
    Ok(())
}
