//! Gossip broadcast protocol
//!
//! Transactions and blocks are flooded with a hop budget (`Route::ttl`).
//! For every outgoing edge the broadcaster decides between the full
//! payload and a light advertisement:
//! - light iff the peer negotiated light broadcast, the feature is on,
//!   and (for blocks) the block is at least `min_light_block_size`
//! - a peer already known to hold the hash is skipped
//!
//! A light transaction is pulled with `TxRequest`. A light block is
//! rebuilt from the local mempool by short hash; whatever is missing is
//! requested by index with `BlockTxRequest` (an empty list asks for every
//! transaction), and the rebuilt block must match its merkle root before
//! it is handed to the chain.

use crate::chain::{ChainClient, ChainError};
use crate::config::GossipConfig;
use crate::core::{Block, BlockHeader, Transaction};
use crate::network::error::P2pError;
use crate::network::filter::{HashFilter, SentFilter, TimedCache};
use crate::network::message::{LightBlock, Message, Route};
use crate::network::peer::Peer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Recently relayed transactions kept to answer pull requests
const RECENT_TX_CAPACITY: usize = 10_000;

/// Recently relayed blocks kept to answer pull requests
const RECENT_BLOCK_CAPACITY: usize = 128;

/// How long relayed payloads stay available to pull requests
const RECENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outstanding light-transaction pulls
const PENDING_TX_CAPACITY: usize = 10_000;

/// Light blocks waiting for their missing transactions
const PENDING_BLOCK_CAPACITY: usize = 64;

// =============================================================================
// Configuration and statistics
// =============================================================================

/// Broadcast tunables
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub max_ttl: u32,
    pub light_broadcast: bool,
    pub min_light_block_size: usize,
    pub tx_filter_size: usize,
    pub block_filter_size: usize,
    pub block_cache_timeout: Duration,
}

impl From<&GossipConfig> for BroadcastConfig {
    fn from(config: &GossipConfig) -> Self {
        Self {
            max_ttl: config.max_ttl,
            light_broadcast: config.light_broadcast,
            min_light_block_size: config.min_light_block_size,
            tx_filter_size: config.tx_filter_size,
            block_filter_size: config.block_filter_size,
            block_cache_timeout: Duration::from_secs(config.block_cache_timeout_secs),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self::from(&GossipConfig::default())
    }
}

/// Gossip counters
#[derive(Debug, Default)]
pub struct GossipStats {
    txs_accepted: AtomicU64,
    blocks_accepted: AtomicU64,
    full_sent: AtomicU64,
    light_sent: AtomicU64,
    duplicates_suppressed: AtomicU64,
    ttl_rejected: AtomicU64,
    tx_requests: AtomicU64,
    block_tx_requests: AtomicU64,
    blocks_reconstructed: AtomicU64,
    integrity_failures: AtomicU64,
}

/// Point-in-time copy of [`GossipStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStatsSnapshot {
    pub txs_accepted: u64,
    pub blocks_accepted: u64,
    pub full_sent: u64,
    pub light_sent: u64,
    pub duplicates_suppressed: u64,
    pub ttl_rejected: u64,
    pub tx_requests: u64,
    pub block_tx_requests: u64,
    pub blocks_reconstructed: u64,
    pub integrity_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GossipStats {
    pub fn snapshot(&self) -> GossipStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GossipStatsSnapshot {
            txs_accepted: get(&self.txs_accepted),
            blocks_accepted: get(&self.blocks_accepted),
            full_sent: get(&self.full_sent),
            light_sent: get(&self.light_sent),
            duplicates_suppressed: get(&self.duplicates_suppressed),
            ttl_rejected: get(&self.ttl_rejected),
            tx_requests: get(&self.tx_requests),
            block_tx_requests: get(&self.block_tx_requests),
            blocks_reconstructed: get(&self.blocks_reconstructed),
            integrity_failures: get(&self.integrity_failures),
        }
    }
}

/// Skeleton of a light block waiting for transactions
#[derive(Debug, Clone)]
struct PendingBlock {
    header: BlockHeader,
    txs: Vec<Option<Transaction>>,
    route: Route,
}

impl PendingBlock {
    fn missing(&self) -> Vec<u32> {
        self.txs
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn into_block(self) -> Option<Block> {
        let transactions: Option<Vec<Transaction>> = self.txs.into_iter().collect();
        Some(Block {
            header: self.header,
            transactions: transactions?,
        })
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Gossip state: dedup filters, pull bookkeeping and counters
pub struct Broadcaster {
    config: BroadcastConfig,
    chain: Arc<dyn ChainClient>,
    tx_filter: HashFilter,
    block_filter: HashFilter,
    tx_sent: SentFilter,
    block_sent: SentFilter,
    pending_txs: TimedCache<String, Route>,
    pending_blocks: TimedCache<String, PendingBlock>,
    recent_txs: TimedCache<String, Transaction>,
    recent_blocks: TimedCache<String, Block>,
    stats: GossipStats,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            tx_filter: HashFilter::new(config.tx_filter_size),
            block_filter: HashFilter::new(config.block_filter_size),
            tx_sent: SentFilter::new(config.tx_filter_size),
            block_sent: SentFilter::new(config.block_filter_size),
            pending_txs: TimedCache::new(PENDING_TX_CAPACITY, config.block_cache_timeout),
            pending_blocks: TimedCache::new(PENDING_BLOCK_CAPACITY, config.block_cache_timeout),
            recent_txs: TimedCache::new(RECENT_TX_CAPACITY, RECENT_TIMEOUT),
            recent_blocks: TimedCache::new(RECENT_BLOCK_CAPACITY, RECENT_TIMEOUT),
            stats: GossipStats::default(),
            chain,
            config,
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn stats(&self) -> GossipStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a transaction hash has been seen
    pub fn has_seen_tx(&self, hash: &str) -> bool {
        self.tx_filter.contains(hash)
    }

    /// Whether a block hash has been seen
    pub fn has_seen_block(&self, hash: &str) -> bool {
        self.block_filter.contains(hash)
    }

    /// Drop per-peer state of a disconnected peer
    pub fn forget_peer(&self, name: &str) {
        self.tx_sent.forget_peer(name);
        self.block_sent.forget_peer(name);
    }

    // =========================================================================
    // Originating
    // =========================================================================

    /// Announce a locally accepted transaction
    pub async fn broadcast_tx(&self, tx: Transaction, peers: &[Arc<Peer>]) -> usize {
        let hash = tx.hash();
        self.tx_filter.insert(&hash);
        self.recent_txs.insert(hash, tx.clone());
        self.relay_tx(&tx, Route::new(self.config.max_ttl), None, peers)
            .await
    }

    /// Announce a locally produced block
    pub async fn broadcast_block(&self, block: Block, peers: &[Arc<Peer>]) -> usize {
        let hash = block.hash();
        self.block_filter.insert(&hash);
        self.recent_blocks.insert(hash, block.clone());
        self.relay_block(&block, Route::new(self.config.max_ttl), None, peers)
            .await
    }

    // =========================================================================
    // Relaying
    // =========================================================================

    async fn relay_tx(
        &self,
        tx: &Transaction,
        route: Route,
        from: Option<&str>,
        peers: &[Arc<Peer>],
    ) -> usize {
        if route.ttl == 0 {
            return 0;
        }
        let hash = tx.hash();
        let mut sent = 0;
        for peer in peers {
            if Some(peer.name()) == from || peer.is_closed() {
                continue;
            }
            if !self.tx_sent.mark(&hash, peer.name()) {
                bump(&self.stats.duplicates_suppressed);
                continue;
            }

            let light = self.config.light_broadcast && peer.supports_light_broadcast();
            let Some(next) = route.next_hop(light) else {
                return sent;
            };
            let msg = if light {
                Message::LightTx {
                    hash: hash.clone(),
                    route: next,
                }
            } else {
                Message::P2PTx {
                    tx: tx.clone(),
                    route: next,
                }
            };

            match peer.send(msg).await {
                Ok(()) => {
                    bump(if light {
                        &self.stats.light_sent
                    } else {
                        &self.stats.full_sent
                    });
                    sent += 1;
                }
                Err(e) => log::warn!("Failed to relay tx {} to {}: {}", hash, peer.addr(), e),
            }
        }
        sent
    }

    async fn relay_block(
        &self,
        block: &Block,
        route: Route,
        from: Option<&str>,
        peers: &[Arc<Peer>],
    ) -> usize {
        if route.ttl == 0 {
            return 0;
        }
        let hash = block.hash();
        let big_enough = block.size() >= self.config.min_light_block_size;
        let mut sent = 0;
        for peer in peers {
            if Some(peer.name()) == from || peer.is_closed() {
                continue;
            }
            if !self.block_sent.mark(&hash, peer.name()) {
                bump(&self.stats.duplicates_suppressed);
                continue;
            }

            let light =
                self.config.light_broadcast && big_enough && peer.supports_light_broadcast();
            let Some(next) = route.next_hop(light) else {
                return sent;
            };
            let msg = if light {
                Message::LightBlock(LightBlock::from_block(block, next))
            } else {
                Message::P2PBlock {
                    block: block.clone(),
                    route: next,
                }
            };

            match peer.send(msg).await {
                Ok(()) => {
                    bump(if light {
                        &self.stats.light_sent
                    } else {
                        &self.stats.full_sent
                    });
                    sent += 1;
                }
                Err(e) => log::warn!("Failed to relay block {} to {}: {}", hash, peer.addr(), e),
            }
        }
        sent
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    fn check_ttl(&self, route: &Route) -> Result<(), P2pError> {
        if route.ttl > self.config.max_ttl {
            bump(&self.stats.ttl_rejected);
            return Err(P2pError::TtlExceeded {
                ttl: route.ttl,
                max: self.config.max_ttl,
            });
        }
        Ok(())
    }

    /// Process a gossip message from `from`
    ///
    /// `peers` are the relay candidates. Errors of class
    /// `ProtocolViolation` should close the sender.
    pub async fn handle(
        &self,
        from: &Arc<Peer>,
        msg: Message,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        match msg {
            Message::P2PTx { tx, route } => {
                self.check_ttl(&route)?;
                self.on_tx(from, tx, route, peers).await
            }
            Message::LightTx { hash, route } => {
                self.check_ttl(&route)?;
                self.on_light_tx(from, hash, route).await
            }
            Message::TxRequest { hash } => self.on_tx_request(from, &hash).await,
            Message::P2PBlock { block, route } => {
                self.check_ttl(&route)?;
                self.on_block(from, block, route, peers).await
            }
            Message::LightBlock(light) => {
                self.check_ttl(&light.route)?;
                self.on_light_block(from, light, peers).await
            }
            Message::BlockTxRequest {
                block_hash,
                indices,
            } => self.on_block_tx_request(from, block_hash, indices).await,
            Message::BlockTxReply {
                block_hash,
                indices,
                txs,
            } => {
                self.on_block_tx_reply(from, block_hash, indices, txs, peers)
                    .await
            }
            other => {
                log::debug!("Ignoring non-gossip {} from {}", other.type_name(), from.addr());
                Ok(())
            }
        }
    }

    async fn on_tx(
        &self,
        from: &Arc<Peer>,
        tx: Transaction,
        route: Route,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let hash = tx.hash();
        self.tx_sent.mark(&hash, from.name());
        // A pulled transaction travels on the route of its advertisement
        let route = self.pending_txs.take(&hash).unwrap_or(route);

        if !self.tx_filter.insert(&hash) {
            bump(&self.stats.duplicates_suppressed);
            return Ok(());
        }

        match self.chain.submit_tx(tx.clone()).await {
            Ok(()) => {}
            Err(ChainError::Duplicate(_)) => return Ok(()),
            Err(ChainError::Rejected(reason)) => {
                log::debug!("Chain rejected tx {} from {}: {}", hash, from.addr(), reason);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        bump(&self.stats.txs_accepted);
        log::debug!("Accepted tx {} from {} (ttl {})", hash, from.addr(), route.ttl);
        self.recent_txs.insert(hash, tx.clone());
        self.relay_tx(&tx, route, Some(from.name()), peers).await;
        Ok(())
    }

    async fn on_light_tx(
        &self,
        from: &Arc<Peer>,
        hash: String,
        route: Route,
    ) -> Result<(), P2pError> {
        self.tx_sent.mark(&hash, from.name());
        if self.tx_filter.contains(&hash)
            || self.pending_txs.contains(&hash)
            || self.chain.has_tx(&hash).await?
        {
            bump(&self.stats.duplicates_suppressed);
            return Ok(());
        }

        self.pending_txs.insert(hash.clone(), route);
        bump(&self.stats.tx_requests);
        log::debug!("Requesting tx {} from {}", hash, from.addr());
        from.send(Message::TxRequest { hash }).await
    }

    async fn on_tx_request(&self, from: &Arc<Peer>, hash: &str) -> Result<(), P2pError> {
        let tx = match self.recent_txs.get(&hash.to_string()) {
            Some(tx) => Some(tx),
            None => self.chain.mempool_tx(hash).await?,
        };
        match tx {
            Some(tx) => {
                self.tx_sent.mark(hash, from.name());
                from.send(Message::P2PTx {
                    tx,
                    route: Route::new(0),
                })
                .await
            }
            None => {
                log::debug!("{} asked for unknown tx {}", from.addr(), hash);
                Ok(())
            }
        }
    }

    async fn on_block(
        &self,
        from: &Arc<Peer>,
        block: Block,
        route: Route,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let hash = block.hash();
        self.block_sent.mark(&hash, from.name());
        if self.block_filter.contains(&hash) {
            bump(&self.stats.duplicates_suppressed);
            return Ok(());
        }
        self.accept_block(from, block, route, peers).await
    }

    async fn accept_block(
        &self,
        from: &Arc<Peer>,
        block: Block,
        route: Route,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let hash = block.hash();
        self.block_filter.insert(&hash);

        match self.chain.submit_block(block.clone()).await {
            Ok(()) => {}
            Err(ChainError::Duplicate(_)) => return Ok(()),
            Err(ChainError::Rejected(reason)) => {
                log::warn!(
                    "Chain rejected block {} from {}: {}",
                    hash,
                    from.addr(),
                    reason
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        bump(&self.stats.blocks_accepted);
        from.update_height(block.height());
        log::info!(
            "Accepted block {} at height {} from {}",
            hash,
            block.height(),
            from.addr()
        );
        self.recent_blocks.insert(hash, block.clone());
        self.relay_block(&block, route, Some(from.name()), peers)
            .await;
        Ok(())
    }

    async fn on_light_block(
        &self,
        from: &Arc<Peer>,
        light: LightBlock,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let hash = light.block_hash();
        self.block_sent.mark(&hash, from.name());
        if self.block_filter.contains(&hash)
            || self.pending_blocks.contains(&hash)
            || self.chain.has_block(&hash).await?
        {
            bump(&self.stats.duplicates_suppressed);
            return Ok(());
        }

        let declared = light.header.tx_count as usize;
        let advertised = light.short_hashes.len() + usize::from(light.first_tx.is_some());
        if declared != advertised || (declared > 0 && light.first_tx.is_none()) {
            bump(&self.stats.integrity_failures);
            return Err(P2pError::MerkleMismatch(hash));
        }

        let pool: HashMap<String, Transaction> = self
            .chain
            .mempool_txs()
            .await?
            .into_iter()
            .map(|tx| (tx.short_hash(), tx))
            .collect();

        let mut txs = Vec::with_capacity(declared);
        if let Some(first) = light.first_tx {
            txs.push(Some(first));
        }
        txs.extend(light.short_hashes.iter().map(|short| pool.get(short).cloned()));

        let pending = PendingBlock {
            header: light.header,
            txs,
            route: light.route,
        };
        let missing = pending.missing();

        if missing.is_empty() {
            return self.finish_block(from, &hash, pending, peers).await;
        }

        // Mostly unknown: ask for everything
        let indices = if missing.len() * 2 > declared {
            Vec::new()
        } else {
            missing
        };
        log::debug!(
            "Light block {} from {} needs {} of {} txs",
            hash,
            from.addr(),
            if indices.is_empty() { declared } else { indices.len() },
            declared
        );
        self.pending_blocks.insert(hash.clone(), pending);
        bump(&self.stats.block_tx_requests);
        from.send(Message::BlockTxRequest {
            block_hash: hash,
            indices,
        })
        .await
    }

    async fn on_block_tx_request(
        &self,
        from: &Arc<Peer>,
        block_hash: String,
        indices: Vec<u32>,
    ) -> Result<(), P2pError> {
        let block = match self.recent_blocks.get(&block_hash) {
            Some(block) => Some(block),
            None => self.chain.block_by_hash(&block_hash).await?,
        };
        let Some(block) = block else {
            log::debug!("{} asked for txs of unknown block {}", from.addr(), block_hash);
            return Ok(());
        };

        let indices: Vec<u32> = if indices.is_empty() {
            (0..block.transactions.len() as u32).collect()
        } else {
            indices
                .into_iter()
                .filter(|i| (*i as usize) < block.transactions.len())
                .collect()
        };
        let txs = indices
            .iter()
            .map(|i| block.transactions[*i as usize].clone())
            .collect();

        from.send(Message::BlockTxReply {
            block_hash,
            indices,
            txs,
        })
        .await
    }

    async fn on_block_tx_reply(
        &self,
        from: &Arc<Peer>,
        block_hash: String,
        indices: Vec<u32>,
        txs: Vec<Transaction>,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let Some(mut pending) = self.pending_blocks.take(&block_hash) else {
            log::debug!("Unsolicited txs for block {} from {}", block_hash, from.addr());
            return Ok(());
        };

        if indices.len() != txs.len() {
            bump(&self.stats.integrity_failures);
            return Err(P2pError::MerkleMismatch(block_hash));
        }
        for (index, tx) in indices.into_iter().zip(txs) {
            if let Some(slot) = pending.txs.get_mut(index as usize) {
                *slot = Some(tx);
            }
        }

        self.finish_block(from, &block_hash, pending, peers).await
    }

    async fn finish_block(
        &self,
        from: &Arc<Peer>,
        hash: &str,
        pending: PendingBlock,
        peers: &[Arc<Peer>],
    ) -> Result<(), P2pError> {
        let route = pending.route;
        let block = match pending.into_block() {
            Some(block) if block.verify_tx_root() => block,
            _ => {
                bump(&self.stats.integrity_failures);
                log::warn!("Discarding reconstruction of block {} from {}", hash, from.addr());
                return Err(P2pError::MerkleMismatch(hash.to_string()));
            }
        };

        bump(&self.stats.blocks_reconstructed);
        self.accept_block(from, block, route, peers).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop timed-out pulls; unfinished blocks count as integrity failures
    pub fn expire(&self) -> usize {
        self.pending_txs.expire();
        let expired = self.pending_blocks.expire();
        for hash in &expired {
            bump(&self.stats.integrity_failures);
            log::warn!("{}", P2pError::ReconstructionTimeout(hash.clone()));
        }
        expired.len()
    }
}
