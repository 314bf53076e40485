//! Core chain objects gossiped between nodes
//!
//! This module contains the data the network moves around:
//! - Transactions (hash, short hash, size estimate)
//! - Blocks (header committing to transactions through a merkle root)

pub mod block;
pub mod transaction;

pub use block::{Block, BlockHeader, BLOCK_HEADER_SIZE};
pub use transaction::{short_hash, Transaction, SHORT_HASH_BYTES, TX_VERSION};
