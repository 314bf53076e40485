//! Background monitors
//!
//! Long-running loops started with the node, each stopping on the
//! node's cancellation token:
//! - dial: keeps outbound connections at the target from the address book
//! - seeds: keeps configured seeds connected, with exponential backoff
//! - heartbeat: pings peers and closes ones that stop answering
//! - address exchange: asks a random peer for addresses
//! - housekeeping: reaps bans, expires light blocks, persists addresses

use crate::network::error::P2pError;
use crate::network::message::Message;
use crate::network::netaddress::NetAddress;
use crate::network::node::Node;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};

// =============================================================================
// Constants
// =============================================================================

/// How often the dial loop checks the outbound count
pub const DIAL_INTERVAL: Duration = Duration::from_secs(5);

/// Parallel outbound dials
pub const MAX_CONCURRENT_DIALS: usize = 8;

/// How often seeds are checked
pub const SEED_INTERVAL: Duration = Duration::from_secs(1);

/// First retry delay for a seed
pub const SEED_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Longest retry delay for a seed
pub const SEED_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on a heartbeat ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Missed pings before a peer is closed
pub const MAX_MISSED_PINGS: u32 = 3;

pub const ADDR_EXCHANGE_INTERVAL: Duration = Duration::from_secs(60);

pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Start every monitor for `node`
pub fn spawn_all(node: Arc<Node>) {
    spawn_loop(node.clone(), DIAL_INTERVAL, "dial", dial_tick);
    spawn_seed_loop(node.clone());
    spawn_loop(node.clone(), HEARTBEAT_INTERVAL, "heartbeat", heartbeat_tick);
    spawn_loop(
        node.clone(),
        ADDR_EXCHANGE_INTERVAL,
        "address exchange",
        addr_exchange_tick,
    );
    spawn_loop(node, HOUSEKEEPING_INTERVAL, "housekeeping", housekeeping_tick);
}

fn spawn_loop<F, Fut>(node: Arc<Node>, period: Duration, name: &'static str, tick: F)
where
    F: Fn(Arc<Node>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = node.cancel_token().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick(node.clone()).await,
            }
        }
        log::debug!("{} monitor stopped", name);
    });
}

// =============================================================================
// Dialing
// =============================================================================

async fn dial_tick(node: Arc<Node>) {
    let outbound = node.outbound_count().await;
    let target = node.config().target_outbound;
    if outbound >= target {
        return;
    }

    let exclude: HashSet<String> = node
        .peers()
        .await
        .iter()
        .map(|p| p.addr().to_string())
        .collect();
    let candidates: Vec<NetAddress> = node
        .addrbook()
        .select(&exclude, target - outbound)
        .into_iter()
        .filter(|addr| !node.blacklist().is_banned(addr.as_str()))
        .collect();
    if candidates.is_empty() {
        return;
    }
    log::debug!(
        "Dialing {} candidates ({}/{} outbound)",
        candidates.len(),
        outbound,
        target
    );

    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_DIALS));
    let mut dials = JoinSet::new();
    for addr in candidates {
        let node = node.clone();
        let permits = permits.clone();
        dials.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match node.connect(addr.clone()).await {
                Ok(peer) => log::info!("Connected to {}", peer.addr()),
                Err(P2pError::DialInProgress(_)) | Err(P2pError::DuplicatePeer(_)) => {}
                Err(e) => log::debug!("Dial to {} failed: {}", addr, e),
            }
        });
    }
    while dials.join_next().await.is_some() {}
}

// =============================================================================
// Seeds
// =============================================================================

struct SeedState {
    backoff: Duration,
    next_attempt: Instant,
}

fn spawn_seed_loop(node: Arc<Node>) {
    let seeds = node.config().seeds.clone();
    if seeds.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let mut states: HashMap<String, SeedState> = seeds
            .iter()
            .map(|seed| {
                (
                    seed.clone(),
                    SeedState {
                        backoff: SEED_BACKOFF_MIN,
                        next_attempt: Instant::now(),
                    },
                )
            })
            .collect();
        let mut ticker = interval(SEED_INTERVAL);
        let cancel = node.cancel_token().clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for seed in &seeds {
                let Some(state) = states.get_mut(seed) else {
                    continue;
                };
                if Instant::now() < state.next_attempt {
                    continue;
                }
                match connect_seed(&node, seed).await {
                    Ok(()) => {
                        state.backoff = SEED_BACKOFF_MIN;
                        state.next_attempt = Instant::now() + SEED_INTERVAL;
                    }
                    Err(e) => {
                        log::debug!(
                            "Seed {} unreachable ({}), retrying in {}s",
                            seed,
                            e,
                            state.backoff.as_secs()
                        );
                        state.next_attempt = Instant::now() + state.backoff;
                        state.backoff = (state.backoff * 2).min(SEED_BACKOFF_MAX);
                    }
                }
            }
        }
        log::debug!("seed monitor stopped");
    });
}

/// Ok when the seed is connected, already or now
async fn connect_seed(node: &Arc<Node>, seed: &str) -> Result<(), P2pError> {
    let addr = NetAddress::resolve(seed).await?;
    if node.is_connected_to(&addr).await {
        return Ok(());
    }
    match node.connect_persistent(addr).await {
        Ok(peer) => {
            log::info!("Connected to seed {}", peer.addr());
            Ok(())
        }
        Err(P2pError::DuplicatePeer(_)) | Err(P2pError::DialInProgress(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Heartbeat
// =============================================================================

async fn heartbeat_tick(node: Arc<Node>) {
    let mut pings = JoinSet::new();
    for peer in node.peers().await {
        pings.spawn(async move {
            let nonce: u64 = rand::random();
            match peer.request(Message::Ping(nonce), PING_TIMEOUT).await {
                Ok(Message::Pong(n)) if n == nonce => peer.stat().record_ok(),
                _ => {
                    let missed = peer.stat().record_fail();
                    if missed >= MAX_MISSED_PINGS {
                        log::warn!(
                            "Peer {} missed {} pings, closing",
                            peer.addr(),
                            missed
                        );
                        peer.close();
                    }
                }
            }
        });
    }
    while pings.join_next().await.is_some() {}
}

// =============================================================================
// Address exchange
// =============================================================================

async fn addr_exchange_tick(node: Arc<Node>) {
    let peer = {
        let peers = node.peers().await;
        match peers.choose(&mut rand::thread_rng()) {
            Some(peer) => peer.clone(),
            None => return,
        }
    };

    match peer.request(Message::GetAddr, PING_TIMEOUT).await {
        Ok(Message::Addr(addrs)) => {
            let added = node.addrbook().add_many(&addrs, peer.name());
            if added > 0 {
                log::debug!("Learned {} addresses from {}", added, peer.addr());
            }
        }
        Ok(other) => log::debug!(
            "Unexpected {} from {} for GetAddr",
            other.type_name(),
            peer.addr()
        ),
        Err(e) => log::debug!("GetAddr to {} failed: {}", peer.addr(), e),
    }
}

// =============================================================================
// Housekeeping
// =============================================================================

async fn housekeeping_tick(node: Arc<Node>) {
    let reaped = node.blacklist().reap_expired();
    if reaped > 0 {
        log::debug!("Reaped {} expired bans", reaped);
    }
    let expired = node.broadcaster().expire();
    if expired > 0 {
        log::warn!("{} light blocks expired before reconstruction", expired);
    }
    if let Err(e) = node.addrbook().persist() {
        log::warn!("Failed to persist address book: {}", e);
    }
}
