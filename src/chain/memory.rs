//! In-memory chain used by the daemon and tests

use super::{ChainClient, ChainError};
use crate::core::{Block, BlockHeader, Transaction};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<u64, Block>,
    by_hash: HashMap<String, u64>,
    confirmed_txs: HashSet<String>,
    mempool: HashMap<String, Transaction>,
    mempool_order: Vec<String>,
}

/// A chain held entirely in memory
///
/// Accepts any block whose hash and height are new and any transaction
/// whose hash is unknown. Mined transactions leave the mempool.
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Create a chain holding only a genesis block
    pub fn new() -> Self {
        let genesis = Block::new(0, "0".repeat(64), vec![]);
        let mut state = ChainState::default();
        state.by_hash.insert(genesis.hash(), 0);
        state.blocks.insert(0, genesis);
        Self {
            state: RwLock::new(state),
        }
    }

    /// Create a chain from an existing sequence of blocks
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        let mut state = ChainState::default();
        for block in blocks {
            for tx in &block.transactions {
                state.confirmed_txs.insert(tx.hash());
            }
            state.by_hash.insert(block.hash(), block.height());
            state.blocks.insert(block.height(), block);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Add a transaction to the mempool without going through the network
    pub async fn add_to_mempool(&self, tx: Transaction) {
        let mut state = self.state.write().await;
        let hash = tx.hash();
        if state.mempool.insert(hash.clone(), tx).is_none() {
            state.mempool_order.push(hash);
        }
    }

    /// Number of blocks held
    pub async fn block_count(&self) -> usize {
        self.state.read().await.blocks.len()
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn submit_tx(&self, tx: Transaction) -> Result<(), ChainError> {
        let hash = tx.hash();
        let mut state = self.state.write().await;
        if state.mempool.contains_key(&hash) || state.confirmed_txs.contains(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        state.mempool.insert(hash.clone(), tx);
        state.mempool_order.push(hash);
        Ok(())
    }

    async fn submit_block(&self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash();
        let mut state = self.state.write().await;
        if state.by_hash.contains_key(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        if state.blocks.contains_key(&block.height()) {
            return Err(ChainError::Rejected(format!(
                "height {} already filled",
                block.height()
            )));
        }
        if !block.verify_tx_root() {
            return Err(ChainError::Rejected(format!("bad tx root in {}", hash)));
        }

        for tx_hash in block.tx_hashes() {
            state.mempool.remove(&tx_hash);
            state.confirmed_txs.insert(tx_hash);
        }
        let ChainState {
            mempool,
            mempool_order,
            ..
        } = &mut *state;
        mempool_order.retain(|h| mempool.contains_key(h));

        state.by_hash.insert(hash, block.height());
        state.blocks.insert(block.height(), block);
        Ok(())
    }

    async fn last_header(&self) -> Result<BlockHeader, ChainError> {
        let state = self.state.read().await;
        state
            .blocks
            .values()
            .next_back()
            .map(|b| b.header.clone())
            .ok_or(ChainError::Unavailable)
    }

    async fn mempool_size(&self) -> Result<usize, ChainError> {
        Ok(self.state.read().await.mempool.len())
    }

    async fn mempool_txs(&self) -> Result<Vec<Transaction>, ChainError> {
        let state = self.state.read().await;
        Ok(state
            .mempool_order
            .iter()
            .filter_map(|h| state.mempool.get(h).cloned())
            .collect())
    }

    async fn mempool_tx(&self, hash: &str) -> Result<Option<Transaction>, ChainError> {
        Ok(self.state.read().await.mempool.get(hash).cloned())
    }

    async fn has_tx(&self, hash: &str) -> Result<bool, ChainError> {
        let state = self.state.read().await;
        Ok(state.mempool.contains_key(hash) || state.confirmed_txs.contains(hash))
    }

    async fn has_block(&self, hash: &str) -> Result<bool, ChainError> {
        Ok(self.state.read().await.by_hash.contains_key(hash))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, ChainError> {
        let state = self.state.read().await;
        Ok(state
            .by_hash
            .get(hash)
            .and_then(|height| state.blocks.get(height))
            .cloned())
    }

    async fn get_blocks(&self, start: u64, end: u64) -> Result<Vec<Block>, ChainError> {
        if start > end {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state.blocks.range(start..=end).map(|(_, b)| b.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u64) -> Transaction {
        Transaction::new("coins", format!("payload{}", n).as_bytes(), 1, n)
    }

    #[tokio::test]
    async fn test_genesis_only() {
        let chain = MemoryChain::new();
        assert_eq!(chain.block_height().await.unwrap(), 0);
        assert_eq!(chain.block_count().await, 1);
    }

    #[tokio::test]
    async fn test_submit_tx_rejects_duplicates() {
        let chain = MemoryChain::new();
        let t = tx(1);
        chain.submit_tx(t.clone()).await.unwrap();
        assert!(matches!(
            chain.submit_tx(t.clone()).await,
            Err(ChainError::Duplicate(_))
        ));
        assert_eq!(chain.mempool_size().await.unwrap(), 1);
        assert!(chain.has_tx(&t.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_clears_mempool() {
        let chain = MemoryChain::new();
        let txs = vec![tx(1), tx(2)];
        for t in &txs {
            chain.submit_tx(t.clone()).await.unwrap();
        }
        chain.submit_tx(tx(3)).await.unwrap();

        let parent = chain.last_header().await.unwrap().hash();
        let block = Block::new(1, parent, txs.clone());
        chain.submit_block(block.clone()).await.unwrap();

        assert_eq!(chain.block_height().await.unwrap(), 1);
        assert_eq!(chain.mempool_size().await.unwrap(), 1);
        assert!(chain.has_tx(&txs[0].hash()).await.unwrap());
        assert!(chain.has_block(&block.hash()).await.unwrap());
        assert_eq!(chain.mempool_txs().await.unwrap()[0].hash(), tx(3).hash());
    }

    #[tokio::test]
    async fn test_bad_root_rejected() {
        let chain = MemoryChain::new();
        let mut block = Block::new(1, "0".repeat(64), vec![tx(1)]);
        block.transactions.push(tx(2));
        assert!(matches!(
            chain.submit_block(block).await,
            Err(ChainError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_block_ranges() {
        let mut blocks = vec![Block::new(0, "0".repeat(64), vec![])];
        for h in 1..=5 {
            let parent = blocks.last().map(|b: &Block| b.hash()).unwrap_or_default();
            blocks.push(Block::new(h, parent, vec![tx(h)]));
        }
        let chain = MemoryChain::with_blocks(blocks);

        let range = chain.get_blocks(2, 4).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].height(), 2);

        let headers = chain.get_headers(4, 10).await.unwrap();
        assert_eq!(headers.len(), 2);
        assert!(chain.get_blocks(5, 1).await.unwrap().is_empty());
    }
}
