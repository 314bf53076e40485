//! Chain collaborator interface
//!
//! The gossip layer does not own the blockchain or the mempool. It talks
//! to them through [`ChainClient`], an asynchronous request/response
//! surface mirroring what the chain subsystem offers:
//! - submit a validated transaction or block
//! - last header and block height
//! - mempool size, listing and lookups
//! - historical block and header ranges for serving peers

pub mod memory;

use crate::core::{Block, BlockHeader, Transaction};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryChain;

/// Errors reported by the chain subsystem
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Already known: {0}")]
    Duplicate(String),
    #[error("Rejected by chain: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Chain unavailable")]
    Unavailable,
}

/// Asynchronous access to the blockchain and mempool
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hand a transaction to the mempool
    async fn submit_tx(&self, tx: Transaction) -> Result<(), ChainError>;

    /// Hand a block to the chain
    async fn submit_block(&self, block: Block) -> Result<(), ChainError>;

    /// Header of the current tip
    async fn last_header(&self) -> Result<BlockHeader, ChainError>;

    /// Height of the current tip
    async fn block_height(&self) -> Result<u64, ChainError> {
        Ok(self.last_header().await?.height)
    }

    /// Number of pending transactions
    async fn mempool_size(&self) -> Result<usize, ChainError>;

    /// Pending transactions, oldest first
    async fn mempool_txs(&self) -> Result<Vec<Transaction>, ChainError>;

    /// A pending transaction by hash
    async fn mempool_tx(&self, hash: &str) -> Result<Option<Transaction>, ChainError>;

    /// Whether a transaction is pending or already on chain
    async fn has_tx(&self, hash: &str) -> Result<bool, ChainError>;

    /// Whether a block is already on chain
    async fn has_block(&self, hash: &str) -> Result<bool, ChainError>;

    /// A block by hash
    async fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, ChainError>;

    /// Blocks in the inclusive height range that exist locally
    async fn get_blocks(&self, start: u64, end: u64) -> Result<Vec<Block>, ChainError>;

    /// Headers in the inclusive height range that exist locally
    async fn get_headers(&self, start: u64, end: u64) -> Result<Vec<BlockHeader>, ChainError> {
        Ok(self
            .get_blocks(start, end)
            .await?
            .into_iter()
            .map(|b| b.header)
            .collect())
    }
}
