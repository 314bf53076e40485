//! Mini-Gossip: the P2P transport and broadcast layer of a blockchain node
//!
//! This crate provides:
//! - Signed peer handshakes over TCP, with optional mutual TLS
//! - Address book, blacklist and identity quarantine
//! - TTL-routed flooding of transactions and blocks
//! - Light broadcast: hash-only relay with pull and merkle-checked rebuild
//! - Parallel block download from a pool of peers
//!
//! The chain itself lives behind [`chain::ChainClient`].
//!
//! # Example
//!
//! ```no_run
//! use mini_gossip::chain::MemoryChain;
//! use mini_gossip::config::GossipConfig;
//! use mini_gossip::network::Node;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mini_gossip::network::P2pError> {
//! let node = Node::new(GossipConfig::default(), Arc::new(MemoryChain::new()))?;
//! let addr = node.start().await?;
//! println!("listening on {:?}", addr);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use chain::{ChainClient, ChainError, MemoryChain};
pub use config::GossipConfig;
pub use core::{Block, BlockHeader, Transaction};
pub use crypto::KeyPair;
pub use network::{Node, P2pError};
pub use storage::KvStore;
