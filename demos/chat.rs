//! Interactive chat over a real TCP cluster.
//!
//! Every process is one node. Lines typed on stdin are broadcast to the
//! members of the `chat` group on every node; casts from other nodes are
//! printed as they arrive. `/who` lists the group, `/quit` leaves.
//!
//! Start a first node:
//!     cargo run --example chat -- 127.0.0.1:7800
//! Join it from other terminals:
//!     cargo run --example chat -- 127.0.0.1:7801 127.0.0.1:7800

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};

use groupcast::{
    run_bootstrap, BootstrapConfig, ClusterEvent, Delivery, Registry, RegistryConfig, TcpConfig,
    TcpTransport,
};

const GROUP: &str = "chat";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groupcast=warn".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let bind: SocketAddr = match args.next() {
        Some(arg) => arg.parse()?,
        None => {
            eprintln!("usage: chat <bind-addr> [seed-addr...]");
            std::process::exit(2);
        }
    };
    let seeds: Vec<SocketAddr> = args.map(|arg| arg.parse()).collect::<Result<_, _>>()?;

    let (transport, mailbox) = TcpTransport::bind(bind, TcpConfig::new()).await?;
    let registry = Registry::new(transport, mailbox, RegistryConfig::lan());
    println!("chatting as {}", registry.local_node());

    let runner = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run().await })
    };
    if !seeds.is_empty() {
        let registry = registry.clone();
        let config = BootstrapConfig::new().with_seeds(seeds);
        tokio::spawn(async move { run_bootstrap(registry, config).await });
    }

    let (me, deliveries) = registry.register()?;
    registry.join(GROUP, me.handle())?;

    tokio::spawn(async move {
        while let Ok(delivery) = deliveries.recv().await {
            if let Delivery::Cast(payload) = delivery {
                println!("{}", String::from_utf8_lossy(&payload));
            }
        }
    });

    let events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClusterEvent::NodeUp(node) => println!("* {node} is up"),
                ClusterEvent::NodeDown(node) => println!("* {node} is gone"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" => break,
            "/who" => {
                for member in registry.members(GROUP) {
                    println!("* {member}");
                }
            }
            text => {
                let message = format!("[{}] {text}", registry.local_node());
                let report = registry
                    .broadcast(GROUP, Bytes::from(message), Some(me.handle()))
                    .await?;
                if !report.is_complete() {
                    println!("* {} unreachable peer(s) missed that", report.unreachable.len());
                }
            }
        }
    }

    registry.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
    Ok(())
}
