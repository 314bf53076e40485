//! Cryptographic utilities for the gossip layer
//!
//! This module provides:
//! - SHA-256 hashing for transaction and block identifiers
//! - secp256k1 identity keys used to sign the peer handshake
//! - Merkle root calculation for light-block reconstruction

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{double_sha256, double_sha256_hex, sha256, sha256_hex};
pub use keys::{public_key_from_hex, sign_message, verify_signature, KeyError, KeyPair};
pub use merkle::{calculate_merkle_root, calculate_merkle_root_hex};
