//! Transactions carried by the gossip layer
//!
//! The gossip layer never validates transaction semantics; that is the
//! chain's job. It only needs a stable hash, a short hash for light
//! block advertisements and a size estimate.

use crate::crypto::sha256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current transaction version
pub const TX_VERSION: u32 = 1;

/// Number of hash bytes kept in a short transaction hash
pub const SHORT_HASH_BYTES: usize = 8;

/// A transaction as seen by the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction version
    pub version: u32,
    /// Executor (target module) of the transaction
    pub execer: String,
    /// Opaque payload, hex encoded
    pub payload: String,
    /// Fee offered
    pub fee: u64,
    /// Sender-chosen nonce
    pub nonce: u64,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Sender public key (hex)
    #[serde(default)]
    pub public_key: String,
    /// Signature over the transaction body (hex)
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    /// Create a new unsigned transaction
    pub fn new(execer: &str, payload: &[u8], fee: u64, nonce: u64) -> Self {
        Self {
            version: TX_VERSION,
            execer: execer.to_string(),
            payload: hex::encode(payload),
            fee,
            nonce,
            timestamp: Utc::now(),
            public_key: String::new(),
            signature: String::new(),
        }
    }

    /// Raw hash bytes of the transaction
    pub fn hash_bytes(&self) -> Vec<u8> {
        let data = format!(
            "{}{}{}{}{}{}{}",
            self.version,
            self.execer,
            self.payload,
            self.fee,
            self.nonce,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            self.public_key
        );
        sha256(data.as_bytes())
    }

    /// Hex transaction hash
    pub fn hash(&self) -> String {
        hex::encode(self.hash_bytes())
    }

    /// Truncated hash used in light block advertisements
    pub fn short_hash(&self) -> String {
        short_hash(&self.hash())
    }

    /// Estimated serialized size in bytes
    pub fn size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Truncate a hex hash to its short form
pub fn short_hash(hash: &str) -> String {
    hash.chars().take(SHORT_HASH_BYTES * 2).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let tx = Transaction::new("coins", b"transfer", 10, 1);
        assert_eq!(tx.hash(), tx.clone().hash());
        assert_eq!(tx.hash().len(), 64);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let tx = Transaction::new("coins", b"transfer", 10, 1);
        let mut other = tx.clone();
        other.nonce = 2;
        assert_ne!(tx.hash(), other.hash());
    }

    #[test]
    fn test_short_hash() {
        let tx = Transaction::new("coins", b"x", 1, 1);
        let short = tx.short_hash();
        assert_eq!(short.len(), SHORT_HASH_BYTES * 2);
        assert!(tx.hash().starts_with(&short));
    }

    #[test]
    fn test_size_grows_with_payload() {
        let small = Transaction::new("coins", b"x", 1, 1);
        let large = Transaction::new("coins", &[7u8; 512], 1, 1);
        assert!(large.size() > small.size());
    }
}
