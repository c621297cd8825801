//! Seed-based cluster bootstrap.
//!
//! Dials a configured list of seed addresses until links come up,
//! backing off exponentially with jitter on failure. Seeds that reject
//! the handshake outright are parked for much longer; linked seeds are
//! re-checked on a slow cadence so a lost seed is eventually re-dialed.
//!
//! Peer identity is learned from the handshake, so seeds are plain
//! socket addresses. A seed pointing at this node itself is skipped.

use futures_timer::Delay;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::registry::Registry;
use crate::transport::Transport;

/// How the bootstrap loop dials its seeds.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootstrapConfig {
    /// Seed addresses to keep linked.
    pub seeds: Vec<SocketAddr>,

    /// Backoff after the first failed dial. Doubles per consecutive
    /// failure.
    ///
    /// Default: 500ms
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub initial_backoff: Duration,

    /// Upper bound for the exponential backoff.
    ///
    /// Default: 30s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub max_backoff: Duration,

    /// Park time for a seed that rejected the handshake. Rejection is
    /// not transient; only a restarted peer changes the outcome.
    ///
    /// Default: 60s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub rejected_backoff: Duration,

    /// How often a linked seed is re-checked.
    ///
    /// Default: 15s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub recheck_interval: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            rejected_backoff: Duration::from_secs(60),
            recheck_interval: Duration::from_secs(15),
        }
    }
}

impl BootstrapConfig {
    /// Create an empty bootstrap configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a seed address (builder pattern).
    pub fn with_seed(mut self, addr: SocketAddr) -> Self {
        self.seeds.push(addr);
        self
    }

    /// Add multiple seed addresses (builder pattern).
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.seeds.extend(seeds);
        self
    }

    /// Set the initial backoff (builder pattern).
    pub const fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the backoff cap (builder pattern).
    pub const fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the park time after a rejected handshake (builder pattern).
    pub const fn with_rejected_backoff(mut self, backoff: Duration) -> Self {
        self.rejected_backoff = backoff;
        self
    }

    /// Set the re-check cadence for linked seeds (builder pattern).
    pub const fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        }
    }
}

struct SeedState {
    failures: u32,
    next_attempt: Instant,
}

/// Exponential backoff for the given consecutive failure count, capped.
fn backoff_delay(config: &BootstrapConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = config
        .initial_backoff
        .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
    delay.min(config.max_backoff)
}

/// Spread a delay by +/- 25% so seeds sharing a config do not dial in
/// lockstep.
fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis().min(u64::MAX as u128) as u64;
    if millis == 0 {
        return delay;
    }
    let spread = (millis / 4).max(1);
    let offset = rand::rng().random_range(0..=spread * 2);
    Duration::from_millis(millis - spread + offset)
}

/// Keep the configured seeds linked until the registry shuts down.
///
/// Spawn this next to [`Registry::run`]. It returns once
/// [`Registry::shutdown`] has been called.
pub async fn run_bootstrap<T: Transport>(registry: Registry<T>, config: BootstrapConfig) {
    let local_addr = registry.local_node().addr();
    let now = Instant::now();
    let mut states: HashMap<SocketAddr, SeedState> = config
        .seeds
        .iter()
        .filter(|addr| **addr != local_addr)
        .map(|addr| {
            (
                *addr,
                SeedState {
                    failures: 0,
                    next_attempt: now,
                },
            )
        })
        .collect();

    if states.is_empty() {
        tracing::debug!("no seeds to dial");
        return;
    }
    tracing::info!(seeds = states.len(), "bootstrap started");

    loop {
        if registry.is_shutdown() {
            tracing::debug!("bootstrap stopped");
            return;
        }

        let linked: Vec<SocketAddr> = registry
            .connected_peers()
            .iter()
            .map(|node| node.addr())
            .collect();
        let now = Instant::now();
        let mut next_wake = now + config.recheck_interval;

        for (addr, state) in states.iter_mut() {
            if linked.contains(addr) {
                state.failures = 0;
                state.next_attempt = now + config.recheck_interval;
                continue;
            }
            if state.next_attempt > now {
                next_wake = next_wake.min(state.next_attempt);
                continue;
            }

            match registry.connect(*addr).await {
                Ok(peer) => {
                    tracing::info!(seed = %addr, peer = %peer, "seed linked");
                    state.failures = 0;
                    state.next_attempt = now + config.recheck_interval;
                }
                Err(Error::Transport(err)) if err.is_permanent() => {
                    tracing::debug!(seed = %addr, error = %err, "seed rejected, parking");
                    state.failures = 0;
                    state.next_attempt = now + config.rejected_backoff;
                }
                Err(err) => {
                    state.failures += 1;
                    let delay = jitter(backoff_delay(&config, state.failures));
                    tracing::debug!(
                        seed = %addr,
                        failures = state.failures,
                        ?delay,
                        error = %err,
                        "seed dial failed"
                    );
                    state.next_attempt = now + delay;
                }
            }
            next_wake = next_wake.min(state.next_attempt);
        }

        // Bounded nap so shutdown is noticed promptly.
        let nap = next_wake
            .saturating_duration_since(Instant::now())
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        Delay::new(nap).await;
    }
}
