//! Blocks carried by the gossip layer
//!
//! A block contains a header with metadata and a list of transactions.
//! The header commits to the transactions through a merkle root, which
//! is what light-block reconstruction is checked against.

use crate::core::transaction::Transaction;
use crate::crypto::{calculate_merkle_root, double_sha256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Block header size in bytes used for size estimates
pub const BLOCK_HEADER_SIZE: usize = 128;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: u32,
    /// Block height
    pub height: u64,
    /// Hash of the parent block
    pub parent_hash: String,
    /// Merkle root of all transactions
    pub tx_root: String,
    /// Number of transactions in the block
    pub tx_count: u32,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl BlockHeader {
    /// Calculate the hash of the block header
    pub fn hash(&self) -> String {
        let data = format!(
            "{}{}{}{}{}{}",
            self.version,
            self.height,
            self.parent_hash,
            self.tx_root,
            self.tx_count,
            self.timestamp.timestamp_millis()
        );
        hex::encode(double_sha256(data.as_bytes()))
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// List of transactions in the block
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block committing to the given transactions
    pub fn new(height: u64, parent_hash: String, transactions: Vec<Transaction>) -> Self {
        let header = BlockHeader {
            version: 1,
            height,
            parent_hash,
            tx_root: Self::calculate_tx_root(&transactions),
            tx_count: transactions.len() as u32,
            timestamp: Utc::now(),
        };

        Self {
            header,
            transactions,
        }
    }

    /// Calculate the merkle root from transactions
    pub fn calculate_tx_root(transactions: &[Transaction]) -> String {
        let tx_hashes: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.hash_bytes()).collect();
        hex::encode(calculate_merkle_root(&tx_hashes))
    }

    /// Block hash (hash of the header)
    pub fn hash(&self) -> String {
        self.header.hash()
    }

    /// Block height
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Verify the block's merkle root against its transactions
    pub fn verify_tx_root(&self) -> bool {
        self.transactions.len() == self.header.tx_count as usize
            && Self::calculate_tx_root(&self.transactions) == self.header.tx_root
    }

    /// Hex hashes of all transactions, in block order
    pub fn tx_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash()).collect()
    }

    /// Estimated size of this block in bytes
    pub fn size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.transactions.iter().map(|tx| tx.size()).sum::<usize>()
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_txs(n: usize) -> Vec<Transaction> {
        (0..n)
            .map(|i| Transaction::new("coins", format!("tx{}", i).as_bytes(), 1, i as u64))
            .collect()
    }

    #[test]
    fn test_new_block_commits_to_transactions() {
        let block = Block::new(1, "0".repeat(64), sample_txs(5));
        assert_eq!(block.header.tx_count, 5);
        assert!(block.verify_tx_root());
    }

    #[test]
    fn test_tampered_transaction_breaks_root() {
        let mut block = Block::new(1, "0".repeat(64), sample_txs(3));
        block.transactions[1].fee += 1;
        assert!(!block.verify_tx_root());
    }

    #[test]
    fn test_missing_transaction_breaks_root() {
        let mut block = Block::new(1, "0".repeat(64), sample_txs(3));
        block.transactions.pop();
        assert!(!block.verify_tx_root());
    }

    #[test]
    fn test_hash_covers_header() {
        let block = Block::new(1, "0".repeat(64), sample_txs(2));
        let mut other = block.clone();
        other.header.height = 2;
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn test_size_includes_transactions() {
        let empty = Block::new(1, "0".repeat(64), vec![]);
        let full = Block::new(1, "0".repeat(64), sample_txs(10));
        assert_eq!(empty.size(), BLOCK_HEADER_SIZE);
        assert!(full.size() > empty.size());
    }
}
